pub mod buffer_pool;
pub mod catalog;
pub mod disk_manager;
pub mod errors;
pub mod index;
pub mod pages;
pub mod record;
pub mod recovery;
pub mod table;
pub mod transaction;

#[cfg(test)]
pub(crate) fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
