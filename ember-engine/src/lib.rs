#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod batch;
pub mod contracts;
pub mod reply;
pub mod reqhash;
pub mod status;
pub mod telemetry;
pub mod ticker;
pub mod txn;
pub mod udf;
