//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod idempotency {
    use super::*;

    pub const NAMESPACE: &str = "idempotency";

    /// Key of the idempotency record for one client- or server-derived key
    #[derive(Debug, Clone)]
    pub struct RecordKey {
        pub key: String,
    }

    impl RecordKey {
        pub fn new(key: impl Into<String>) -> Self {
            Self { key: key.into() }
        }
    }

    impl fmt::Display for RecordKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:{}", VERSION, NAMESPACE, self.key)
        }
    }
}

pub mod webhook {
    use super::*;

    pub const NAMESPACE: &str = "webhook";

    /// Dedupe claim for one gateway notification delivery
    #[derive(Debug, Clone)]
    pub struct DedupeKey {
        pub event_code: String,
        pub success: bool,
        pub psp_reference: String,
        pub merchant_reference: String,
    }

    impl DedupeKey {
        pub fn new(
            event_code: impl Into<String>,
            success: bool,
            psp_reference: impl Into<String>,
            merchant_reference: impl Into<String>,
        ) -> Self {
            Self {
                event_code: event_code.into(),
                success,
                psp_reference: psp_reference.into(),
                merchant_reference: merchant_reference.into(),
            }
        }
    }

    impl fmt::Display for DedupeKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:{}:{}:{}:{}",
                VERSION,
                NAMESPACE,
                self.event_code,
                self.success,
                self.psp_reference,
                self.merchant_reference
            )
        }
    }
}

pub mod jobs {
    use super::*;
    use uuid::Uuid;

    pub const NAMESPACE: &str = "jobs";

    /// Serialized body of one persisted job
    #[derive(Debug, Clone)]
    pub struct JobKey {
        pub queue: String,
        pub id: Uuid,
    }

    impl JobKey {
        pub fn new(queue: impl Into<String>, id: Uuid) -> Self {
            Self {
                queue: queue.into(),
                id,
            }
        }

        /// Lease naming the instance that currently holds the job
        pub fn owner(&self) -> String {
            format!("{}:owner", self)
        }
    }

    impl fmt::Display for JobKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:{}:{}", VERSION, NAMESPACE, self.queue, self.id)
        }
    }

    /// Sorted set of a queue's persisted job ids, scored by due time
    #[derive(Debug, Clone)]
    pub struct IndexKey {
        pub queue: String,
    }

    impl IndexKey {
        pub fn new(queue: impl Into<String>) -> Self {
            Self {
                queue: queue.into(),
            }
        }
    }

    impl fmt::Display for IndexKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:{}:index", VERSION, NAMESPACE, self.queue)
        }
    }
}
