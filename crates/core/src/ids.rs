use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the implicit root branch every chat starts with.
pub const MAIN_BRANCH: &str = "main";

// All ids are opaque strings so persisted dumps from other front ends load unchanged.
macro_rules! define_chat_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Mints a fresh time-ordered id, e.g. `chat-0190f3...`.
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::now_v7().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ok(Self::new(raw))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_chat_id!(ChatId, "chat");
define_chat_id!(MessageId, "msg");
define_chat_id!(BranchId, "branch");
define_chat_id!(FileId, "file");

impl BranchId {
    pub fn main() -> Self {
        Self::new(MAIN_BRANCH)
    }

    pub fn is_main(&self) -> bool {
        self.0 == MAIN_BRANCH
    }
}

impl Default for BranchId {
    fn default() -> Self {
        Self::main()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_are_unique() {
        let first = BranchId::generate();
        let second = BranchId::generate();

        assert!(first.as_str().starts_with("branch-"));
        assert_ne!(first, second);
        assert!(!first.is_main());
    }

    #[test]
    fn main_branch_serializes_as_plain_string() {
        let encoded = serde_json::to_string(&BranchId::main()).expect("serialize branch id");
        assert_eq!(encoded, "\"main\"");

        let decoded: BranchId = serde_json::from_str(&encoded).expect("deserialize branch id");
        assert!(decoded.is_main());
    }
}
