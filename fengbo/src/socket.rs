// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

#![allow(clippy::module_name_repetitions)]

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use tokio::net::TcpListener;

use crate::error::Error;
#[cfg(unix)]
use crate::error::ErrorKind;

#[cfg(unix)]
fn set_reuse_addr(socket_fd: RawFd) -> Result<(), Error> {
    let value: i32 = 1;
    let value_ptr = std::ptr::addr_of!(value) as usize;

    unsafe {
        #[allow(clippy::cast_possible_truncation)]
        let len = std::mem::size_of_val(&value) as nc::socklen_t;
        nc::setsockopt(socket_fd, nc::SOL_SOCKET, nc::SO_REUSEADDR, value_ptr, len).map_err(
            |errno| {
                Error::from_string(
                    ErrorKind::KernelError,
                    format!(
                        "Failed to set SO_REUSEADDR, got err: {}",
                        nc::strerror(errno)
                    ),
                )
            },
        )
    }
}

#[cfg(not(unix))]
fn set_reuse_addr(_socket_fd: i32) -> Result<(), Error> {
    Ok(())
}

/// Create a new tcp server socket listening at `address`.
///
/// # Errors
///
/// Returns error if socket `address` is invalid or in use.
pub async fn new_tcp_listener(address: &str) -> Result<TcpListener, Error> {
    let listener = TcpListener::bind(address).await?;

    #[cfg(unix)]
    {
        let socket_fd: RawFd = listener.as_raw_fd();
        set_reuse_addr(socket_fd)?;
    }

    Ok(listener)
}
