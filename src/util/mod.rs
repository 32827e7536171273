//! Text helpers shared by the reply and digest renderers.
//!
//! ```
//! use rss_email::util::{escape_html, truncate_chars};
//!
//! let title = escape_html("Rust & Go");
//! assert_eq!(title, "Rust &amp; Go");
//! assert_eq!(truncate_chars("A long summary", 9), "A long...");
//! ```

mod text;

pub use text::{escape_html, truncate_chars};
