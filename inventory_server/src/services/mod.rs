//! Inventory and scan services: the business logic over providers and the store.

pub mod clone_service;
pub mod fanout;
pub mod inventory_service;
pub mod project_service;
pub mod report_parser;
pub mod scan_service;
pub mod scan_tools;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;
