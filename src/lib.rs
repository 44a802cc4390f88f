pub mod buffer_pool;
pub mod disk_manager;
pub mod errors;
pub mod indexes;
pub mod latch;
pub mod pages;
pub mod recovery;
pub mod table;
pub mod tuple;
pub mod txn_manager;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// `RUST_LOG=debug cargo test -- --nocapture` to see subsystem logs.
    pub fn init_logging() {
        INIT.call_once(|| {
            let _ = env_logger::Builder::from_default_env()
                .format_timestamp_millis()
                .is_test(true)
                .try_init();
        });
    }

    pub fn test_path() -> String {
        let id = uuid::Uuid::new_v4();
        format!("data/test/test_{}", id)
    }
}
