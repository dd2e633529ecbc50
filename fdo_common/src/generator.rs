use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Source of generated values such as the current time or fresh identifiers.
/// Protocol code takes an `impl Generator<T>` instead of calling e.g. `Utc::now()`
/// directly, so that tests can substitute fixed values.
pub trait Generator<T> {
    fn generate(&self) -> T;
}

pub struct TimeGenerator;
impl Generator<DateTime<Utc>> for TimeGenerator {
    fn generate(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct UuidGenerator;
impl Generator<Uuid> for UuidGenerator {
    fn generate(&self) -> Uuid {
        Uuid::new_v4()
    }
}

#[cfg(any(test, feature = "mock_generators"))]
pub mod mock {
    use chrono::{offset::TimeZone, DateTime, Utc};
    use uuid::{uuid, Uuid};

    use super::Generator;

    pub struct FixedUuidGenerator;

    impl Generator<Uuid> for FixedUuidGenerator {
        fn generate(&self) -> Uuid {
            uuid!("c9723aef-022b-4ab7-9cc3-ff4227ec1cc9")
        }
    }

    pub struct EpochGenerator;

    impl Generator<DateTime<Utc>> for EpochGenerator {
        fn generate(&self) -> DateTime<Utc> {
            Utc.timestamp_nanos(0)
        }
    }
}
