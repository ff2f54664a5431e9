//! Pipeline stages for adaptive document conversion.
//!
//! Each submodule owns one concern so it can be tested on its own.
//!
//! ## Data Flow
//!
//! ```text
//! staging ──▶ strategy ──▶ executor ──▶ staging
//! (validate)   (select)    (converter)  (finalize)
//!                 │            ▲
//!                 ├─ chunking ─┘   split / merge
//!                 └─ extract       text fallback
//!                     monitor      supervises every converter child
//! ```
//!
//! 1. [`staging`]: validate the input and own the scoped working directory
//! 2. [`strategy`]: choose single-file or chunked; degrade to text extraction
//! 3. [`chunking`]: split oversized markup; merge fragment outputs; blocking,
//!    run in `spawn_blocking`
//! 4. [`executor`]: build the converter argv and run it with logs on disk
//! 5. [`monitor`]: memory sampling and the SIGTERM/SIGKILL supervisor
//! 6. [`extract`]: converter-free text extraction of last resort

pub mod chunking;
pub mod executor;
pub mod extract;
pub mod monitor;
pub mod staging;
pub mod strategy;
