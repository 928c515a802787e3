//! Account record carrying the storage quota.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An account that owns sessions and files. Requests present the
/// `api_key` as a bearer credential; sessions without one are anonymous.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Owner {
    pub id: Uuid,
    pub name: String,
    pub api_key: String,

    /// NULL means unlimited.
    pub quota_bytes: Option<i64>,

    /// Bytes of finalized files currently attributed to this owner.
    pub used_bytes: i64,

    pub created_at: DateTime<Utc>,
}

impl Owner {
    /// Whether `additional` more bytes still fit under the quota.
    /// An addition that would overflow never fits.
    pub fn has_room_for(&self, additional: i64) -> bool {
        match self.quota_bytes {
            Some(quota) => self
                .used_bytes
                .checked_add(additional)
                .is_some_and(|total| total <= quota),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(quota_bytes: Option<i64>, used_bytes: i64) -> Owner {
        Owner {
            id: Uuid::new_v4(),
            name: "alice".into(),
            api_key: "key".into(),
            quota_bytes,
            used_bytes,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn quota_checks_do_not_wrap_near_the_limit() {
        let nearly_full = owner(Some(i64::MAX), i64::MAX - 4);
        assert!(nearly_full.has_room_for(4));
        assert!(!nearly_full.has_room_for(5));
    }

    #[test]
    fn missing_quota_is_unlimited() {
        assert!(owner(None, i64::MAX).has_room_for(i64::MAX));
    }
}
