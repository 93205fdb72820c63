mod exact;
mod semantic;

pub use exact::{ExactCache, key_for};
pub use semantic::{SemanticCache, point_id};
