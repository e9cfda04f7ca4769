//! Shopping cart sample domain on top of the keel runtime.
//!
//! - [`cart`]: the `ShoppingCart` persistent entity (open / checked out).
//! - [`report`]: a read side keeping one report row per cart.
//! - [`topic`]: the public cart message and its translation from events.

pub mod cart;
pub mod report;
pub mod topic;

pub use cart::{CartCommand, CartEvent, CartState, CartSummary, ShoppingCart};
pub use report::{CartReport, CartReportHandler, REPORT_TABLE};
pub use topic::{CartMessage, TOPIC_ID, translate};
