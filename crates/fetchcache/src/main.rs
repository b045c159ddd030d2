//! Fetchcache.
//!
//! Maintenance tool for the on-disk caches of fetchcache. It inspects and edits individual
//! entries of a named cache instance, and sweeps expired and orphaned files.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
