pub mod helpers;

mod tests_flush_failure;
mod tests_lookup;
mod tests_restart;
mod tests_snapshot;
