//! B+Tree Module
//!
//! Page-oriented B+tree with copy-on-write updates.
//!
//! ## Responsibilities
//! - Read path: search pages of the snapshot map directly
//! - Write path: materialize root-to-leaf paths as arena nodes and edit those
//! - Commit: rebalance underfull nodes, then spill nodes to new pages
//! - Ordered traversal through `Cursor`
//!
//! ## Shape
//! ```text
//!                 ┌─────────────────┐
//!                 │ branch [a, m]   │
//!                 └────┬───────┬────┘
//!            ┌─────────┘       └─────────┐
//!   ┌────────▼────────┐         ┌────────▼────────┐
//!   │ leaf a b c ...  │         │ leaf m n o ...  │
//!   └─────────────────┘         └─────────────────┘
//! ```
//! Branch keys are the first key of the child they point to. All values live
//! in leaves; a leaf entry flagged as a bucket holds a nested bucket header.

pub(crate) mod node;
pub(crate) mod tree;
mod cursor;

pub use cursor::Cursor;
pub(crate) use cursor::CursorCore;
