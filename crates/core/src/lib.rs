pub mod audit;
pub mod business;
pub mod config;
pub mod domain;
pub mod errors;
pub mod notify;
pub mod pricing;
pub mod rollout;
pub mod schema;
pub mod validation;

pub use business::{BusinessProfile, SchemaSource, StaticSchemaSource};
pub use domain::call::CallRecord;
pub use domain::extraction::{ExtractionFailure, ExtractionResult};
pub use domain::field::{FieldValue, FieldValues};
pub use domain::session::{NextAction, Session, SessionId, SessionStatus, Speaker, TranscriptEntry};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use pricing::{DistanceLookup, DistanceSource, PricingRules, QuoteBreakdown};
pub use rollout::{choose_strategy, RolloutConfig, StrategyKind};
pub use schema::{FieldSchema, FieldSpec, FieldType};
pub use validation::ValidationRejected;
