pub mod bin_entry;
pub mod counter;
pub mod node;
pub mod table;
