#[macro_use]
extern crate lazy_static;

mod conn_ext;
mod each_chunk;

pub use conn_ext::{ConnExt, UncheckedTransaction};
pub use each_chunk::{each_chunk, each_chunk_mapped, each_sized_chunk_mapped};
