pub mod core;
pub mod overview;
pub mod priority;
pub mod settings;
pub mod sync;
pub mod tracking;
pub mod warnings;
