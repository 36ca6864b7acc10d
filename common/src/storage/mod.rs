pub mod db;
pub mod destination;
pub mod indexes;
pub mod types;
