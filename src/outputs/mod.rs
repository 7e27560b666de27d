//! Where collected articles end up.
//!
//! # Submodules
//!
//! - [`sheet`]: the [`sheet::SheetStore`] seam, backend selection and the
//!   append pass that filters already-stored URLs
//! - [`google`]: Google Sheets backend (service account + Sheets v4)
//! - [`csv`]: local CSV backend
//! - [`json`]: per-run JSON snapshot files

pub mod csv;
pub mod google;
pub mod json;
pub mod sheet;
