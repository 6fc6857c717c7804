use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(
        "cannot fault page {{file page id = {file_page_id}, swapper id = {swapper_id}}} into \
         cache page {cache_page_id}: already bound to {{file page id = {current_file_page_id}, \
         swapper id = {current_swapper_id}}}"
    )]
    IllegalFault {
        cache_page_id: usize,
        swapper_id: u32,
        file_page_id: u64,
        current_swapper_id: u32,
        current_file_page_id: u64,
    },
    #[error("swapper id {0} is not registered")]
    UnknownSwapper(u32),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
