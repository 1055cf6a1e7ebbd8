pub mod baseline;
pub mod collector;
pub mod configs;
pub mod ingest;
pub mod promoter;
pub mod records;
pub mod risk;
pub mod tasks;
pub mod verification_loop;
