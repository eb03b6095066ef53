//! Pipeline stages for one PDF-to-image conversion.
//!
//! ## Data Flow
//!
//! ```text
//! fetch ──▶ stage ──▶ launch ──▶ harvest ──▶ cleanup
//! (HTTP)    (temp-<id>.pdf)  (memfd child)  (output_image-<id>.png)
//! ```
//!
//! 1. [`fetch`]: download the source document; the only stage with
//!    network I/O
//! 2. [`stage`]: write it to a uniquely named input file and own both
//!    staging paths until cleanup
//! 3. [`job`]: run the converter image in a child, read its output and
//!    enforce admission and timeouts

pub mod fetch;
pub mod job;
pub mod stage;
