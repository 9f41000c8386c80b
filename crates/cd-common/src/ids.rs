use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type};
use ulid::Ulid;

/// An opaque 128-bit identifier. Every entity in §3 is keyed by one of
/// these; the newtype wrapper keeps a `BuildId` from being accidentally
/// compared with a `DeploymentId` at a call site.
///
/// `ulid::Ulid` has no native `sqlx::Type` impl, so each id is persisted as
/// `TEXT` via its `Display`/`FromStr` round-trip rather than `#[sqlx(transparent)]`.
macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Ulid);

        impl $name {
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            pub fn nil() -> Self {
                Self(Ulid::nil())
            }

            pub fn ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Ulid::from_str(s)?))
            }
        }

        impl From<Ulid> for $name {
            fn from(u: Ulid) -> Self {
                Self(u)
            }
        }

        impl Type<Postgres> for $name {
            fn type_info() -> PgTypeInfo {
                <String as Type<Postgres>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <String as Type<Postgres>>::compatible(ty)
            }
        }

        impl<'q> Encode<'q, Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut PgArgumentBuffer,
            ) -> sqlx::encode::IsNull {
                <String as Encode<'q, Postgres>>::encode(self.0.to_string(), buf)
            }
        }

        impl<'r> Decode<'r, Postgres> for $name {
            fn decode(
                value: PgValueRef<'r>,
            ) -> Result<Self, Box<dyn std::error::Error + Sync + Send + 'static>> {
                let raw = <&str as Decode<'r, Postgres>>::decode(value)?;
                Ok(Self(Ulid::from_str(raw)?))
            }
        }
    };
}

opaque_id!(BuildId);
opaque_id!(DeploymentId);
opaque_id!(ProjectRef);
opaque_id!(TenantRef);
opaque_id!(ContainerId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_from_str() {
        let id = BuildId::new();
        let parsed: BuildId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn distinct_ids_never_collide() {
        let a = DeploymentId::new();
        let b = DeploymentId::new();
        assert_ne!(a, b);
    }
}
