// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! `ServerContext` is the main entry point of the fengbo server.

use std::fs::File;
use std::io::{Read, Write};
use tokio::runtime::Runtime;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::commands::{
    DispatcherToServerContexCmd, ServerContextToAuthCmd, ServerContextToDispatcherCmd,
};
use crate::config::Config;
use crate::error::{Error, ErrorKind};

mod init;
pub mod run;

pub const CHANNEL_CAPACITY: usize = 16;

/// `ServerContext` manages the lifetime of dispatcher, listeners, auth,
/// metrics and bridge tasks.
///
/// All kernel signals are handled here and turned into commands; signal
/// handlers never touch broker state themselves.
pub struct ServerContext {
    config: Config,

    // server_ctx -> dispatcher
    dispatcher_sender: Sender<ServerContextToDispatcherCmd>,
    dispatcher_receiver: Option<Receiver<ServerContextToDispatcherCmd>>,

    // dispatcher -> server_ctx
    dispatcher_done_sender: Option<Sender<DispatcherToServerContexCmd>>,
    dispatcher_done_receiver: Receiver<DispatcherToServerContexCmd>,

    // server_ctx -> auth
    auth_sender: Sender<ServerContextToAuthCmd>,
    auth_receiver: Option<Receiver<ServerContextToAuthCmd>>,
}

impl ServerContext {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (dispatcher_sender, dispatcher_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let (dispatcher_done_sender, dispatcher_done_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let (auth_sender, auth_receiver) = mpsc::channel(CHANNEL_CAPACITY);

        Self {
            config,

            dispatcher_sender,
            dispatcher_receiver: Some(dispatcher_receiver),

            dispatcher_done_sender: Some(dispatcher_done_sender),
            dispatcher_done_receiver,

            auth_sender,
            auth_receiver: Some(auth_receiver),
        }
    }

    /// Send `SIGHUP` signal to a running broker process.
    ///
    /// # Errors
    ///
    /// Returns error if the pid file cannot be read or the process is gone.
    pub fn send_reload_signal(&mut self) -> Result<(), Error> {
        #[cfg(unix)]
        return self.send_signal(nc::SIGHUP);

        #[cfg(not(unix))]
        return self.send_signal(0);
    }

    /// Send `SIGTERM` signal to a running broker process.
    ///
    /// # Errors
    ///
    /// Returns error if the pid file cannot be read or the process is gone.
    pub fn send_stop_signal(&mut self) -> Result<(), Error> {
        #[cfg(unix)]
        return self.send_signal(nc::SIGTERM);

        #[cfg(not(unix))]
        return self.send_signal(0);
    }

    #[cfg(not(unix))]
    fn send_signal(&mut self, _sig: i32) -> Result<(), Error> {
        Ok(())
    }

    #[cfg(unix)]
    fn send_signal(&mut self, sig: i32) -> Result<(), Error> {
        let mut fd = File::open(self.config.general().pid_file())?;
        let mut pid_str = String::new();
        fd.read_to_string(&mut pid_str)?;
        let pid = pid_str.trim().parse::<i32>().map_err(|err| {
            Error::from_string(
                ErrorKind::PidError,
                format!(
                    "Failed to parse pid {:?} from file {:?}, err: {:?}",
                    pid_str,
                    self.config.general().pid_file(),
                    err
                ),
            )
        })?;

        unsafe {
            nc::kill(pid, sig).map_err(|errno| {
                Error::from_string(
                    ErrorKind::PidError,
                    format!(
                        "Failed to notify process {}, got {}",
                        pid,
                        nc::strerror(errno)
                    ),
                )
            })?;
        }
        Ok(())
    }

    fn write_pid(&self) -> Result<(), Error> {
        let pid = std::process::id();
        let mut fd = File::create(self.config.general().pid_file()).map_err(|err| {
            Error::from_string(
                ErrorKind::IoError,
                format!(
                    "Failed to write pid to file {:?}, got err: {:?}",
                    self.config.general().pid_file(),
                    err
                ),
            )
        })?;
        write!(fd, "{pid}")?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn set_uid(&self) -> Result<(), Error> {
        Ok(())
    }

    /// When started as root, drop privileges to the configured user.
    #[cfg(unix)]
    fn set_uid(&self) -> Result<(), Error> {
        let euid = unsafe { nc::geteuid() };
        if euid != 0 {
            // Normal user, do nothing.
            return Ok(());
        }
        let user = self.config.general().user();
        let uid = lookup_uid(user)?;
        if let Err(errno) = unsafe { nc::setuid(uid) } {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("Failed to setuid({}), got err: {}", uid, nc::strerror(errno)),
            ));
        }
        Ok(())
    }

    /// Init modules and run the tokio runtime until a terminating signal
    /// arrives.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Server config is invalid
    /// - A listener address cannot be bound
    /// - The persistence file is unusable
    /// - Failed to write pid to file
    pub fn run_loop(&mut self, runtime: &Runtime) -> Result<(), Error> {
        if let Err(err) = self.config.validate() {
            eprintln!("Failed to validate config file!");
            return Err(err);
        }

        self.write_pid()?;

        runtime.block_on(async {
            self.init_modules().await?;
            self.run_inner_loop().await
        })
    }

    #[cfg(unix)]
    async fn run_inner_loop(&mut self) -> Result<(), Error> {
        log::info!("ServerContext::run_inner_loop()");
        let mut sighup_stream = signal(SignalKind::hangup())?;
        let mut sigusr1_stream = signal(SignalKind::user_defined1())?;
        let mut sigusr2_stream = signal(SignalKind::user_defined2())?;
        let mut sigterm_stream = signal(SignalKind::terminate())?;
        let mut sigquit_stream = signal(SignalKind::quit())?;
        let mut sigint_stream = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                Some(_) = sighup_stream.recv() => {
                    log::info!("SIGHUP: reload security config");
                    self.dispatcher_sender
                        .send(ServerContextToDispatcherCmd::Reload)
                        .await?;
                    self.auth_sender.send(ServerContextToAuthCmd::Reload).await?;
                },
                Some(_) = sigusr1_stream.recv() => {
                    log::info!("SIGUSR1: write persistence snapshot");
                    self.dispatcher_sender
                        .send(ServerContextToDispatcherCmd::Backup)
                        .await?;
                },
                Some(_) = sigusr2_stream.recv() => {
                    self.dispatcher_sender
                        .send(ServerContextToDispatcherCmd::DumpSubscriptions)
                        .await?;
                },
                Some(_) = sigterm_stream.recv() => {
                    log::info!("Quit with SIGTERM");
                    break;
                }
                Some(_) = sigquit_stream.recv() => {
                    log::info!("Quit with SIGQUIT");
                    break;
                }
                Some(_) = sigint_stream.recv() => {
                    log::info!("Quit with SIGINT");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    #[cfg(not(unix))]
    async fn run_inner_loop(&mut self) -> Result<(), Error> {
        tokio::signal::ctrl_c().await?;
        log::info!("Quit with ctrl-c");
        self.shutdown().await
    }

    /// Graceful exit: the dispatcher saves its final snapshot and
    /// confirms before the process ends.
    async fn shutdown(&mut self) -> Result<(), Error> {
        self.dispatcher_sender
            .send(ServerContextToDispatcherCmd::Shutdown)
            .await?;
        match self.dispatcher_done_receiver.recv().await {
            Some(DispatcherToServerContexCmd::ShutdownComplete) | None => Ok(()),
        }
    }
}

/// Resolve a username to its uid via `/etc/passwd`.
#[cfg(unix)]
fn lookup_uid(username: &str) -> Result<u32, Error> {
    let content = std::fs::read_to_string("/etc/passwd")?;
    for line in content.lines() {
        let mut fields = line.split(':');
        let name = fields.next().unwrap_or_default();
        if name != username {
            continue;
        }
        // Skip the password field.
        let _passwd = fields.next();
        if let Some(uid) = fields.next() {
            return uid.parse::<u32>().map_err(|_err| {
                Error::from_string(
                    ErrorKind::ConfigError,
                    format!("Invalid uid for user {username}"),
                )
            });
        }
    }
    Err(Error::from_string(
        ErrorKind::ConfigError,
        format!("Failed to find user entry by name: {username}"),
    ))
}
