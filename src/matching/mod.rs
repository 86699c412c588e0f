//! Value matching, identity-key resolution and deep-match quality.

pub mod idkey;
pub mod quality;
pub mod value;

pub use idkey::{identity_keys, identity_signature, IdentityKey, IdentityKeyKind};
pub use quality::{ambiguity_multiplier, deep_match_quality, simplicity_bonus};
pub use value::{is_matching, MatchResult, MatchType};
