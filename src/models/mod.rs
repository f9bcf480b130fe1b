pub mod cloud;
pub mod document;
pub mod search;
