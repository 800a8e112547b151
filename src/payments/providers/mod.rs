//! Concrete gateway adapters

pub mod adyen;
