pub use std::collections::{BTreeMap, BTreeSet};
pub use std::time::Duration;

pub use time::OffsetDateTime;
pub use tracing::{debug, error, info, instrument, trace, warn};
pub use url::Url;
pub use uuid::Uuid;

pub use tunnistamo_proto::constants::*;
pub use tunnistamo_proto::OperationError;

pub use crate::be::Db;
pub use crate::utils::duration_from_epoch_now;
