//! Typed tasks: bind a task key to a payload type at compile time.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A payload type bound to one task key.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Summarize {
///     text: String,
/// }
///
/// impl TypedTask for Summarize {
///     const KEY: &'static str = "consult.summarize.v1";
///     type Output = String;
/// }
/// ```
///
/// Key naming: `{domain}.{action}.v{major}`.
pub trait TypedTask: DeserializeOwned + Send + Sync + 'static {
    const KEY: &'static str;

    /// Value recorded as the task's output.
    type Output: Serialize + Send + 'static;
}
