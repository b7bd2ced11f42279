//! Header names and status values used on the pull and acknowledge surfaces

/// Requested item count for a pull
pub const COUNT: &str = "Count";
/// Store wipe instruction applied after a pull completes
pub const CLEAR: &str = "Clear";
/// Include remaining-count headers in each response chunk
pub const INFO: &str = "Info";
/// Retrieval order: `LIFO`, absent means FIFO
pub const ORDER: &str = "Order";

/// Echo of the request message id
pub const REQUEST_ID: &str = "Request-Id";
/// Per-item index within one pull response
pub const INDEX: &str = "Index";
/// Total items in this pull response
pub const TOTAL_COUNT: &str = "Total-Count";
/// Remaining priority message count (sent when Info requested)
pub const PRIORITY_MESSAGES: &str = "Priority-Messages";
/// Remaining regular message count (sent when Info requested)
pub const REGULAR_MESSAGES: &str = "Regular-Messages";

/// Response status header
pub const STATUS: &str = "Status";
/// Reason attached to a negative acknowledgement
pub const NEGATIVE_REASON: &str = "Negative-Reason";

/// Pull response terminator
pub const STATUS_END: &str = "END";
/// Pull found no messages
pub const STATUS_EMPTY: &str = "EMPTY";
/// Pull request was malformed
pub const STATUS_UNACCEPTABLE: &str = "UNACCEPTABLE";

/// Values accepted by the `Clear` header
pub const CLEAR_ALL: &str = "all";
pub const CLEAR_PRIORITY: &str = "high-priority";
pub const CLEAR_REGULAR: &str = "default-priority";

/// Value accepted by the `Order` header for tail-first retrieval
pub const ORDER_LIFO: &str = "LIFO";
