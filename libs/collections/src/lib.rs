//! # Bounded Containers
//!
//! Fixed-memory primitives used by the coordinator, the execution consumer and
//! the resilience layer. Every container has a capacity chosen at construction
//! and never grows past it.
//!
//! - [`RingBuffer`]: FIFO with reject-on-full `push` and evicting `push_overwrite`
//! - [`LruCache`]: entry-bounded cache, O(1) get/insert/remove
//! - [`top_k_by`] / [`bottom_k_by`]: O(N log k) selection over any iterator
//! - [`RollingWindow`]: O(1) running sum/average that refuses non-finite samples
//!
//! ```rust
//! use collections::{RingBuffer, RollingWindow};
//!
//! let mut recent = RingBuffer::new(3);
//! for v in 1..=4 {
//!     recent.push_overwrite(v);
//! }
//! assert_eq!(recent.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
//!
//! let mut latency = RollingWindow::new(8);
//! latency.push(1.5).unwrap();
//! assert!(latency.push(f64::NAN).is_err());
//! assert_eq!(latency.average(), Some(1.5));
//! ```

pub mod lru;
pub mod ring_buffer;
pub mod rolling_window;
pub mod top_k;

pub use lru::LruCache;
pub use ring_buffer::RingBuffer;
pub use rolling_window::{NonFiniteValue, RollingWindow};
pub use top_k::{bottom_k, bottom_k_by, top_k, top_k_by};
