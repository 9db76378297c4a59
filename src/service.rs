//! The call event loop and the handle the application talks to.

use crate::config::CallConfig;
use crate::controller::{CallController, CallDeps, CallSnapshot};
use crate::error::CallError;
use crate::logger;
use crate::peer::RemoteStreams;
use crate::session::{CallSession, CallTarget, MediaKind, UserId};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

#[derive(Debug)]
enum CallCommand {
    StartCall {
        target: CallTarget,
        kind: MediaKind,
        reply: Reply<CallSession>,
    },
    AcceptCall {
        reply: Reply<CallSession>,
    },
    RejectCall {
        reply: Reply<()>,
    },
    HangUp {
        reply: Reply<()>,
    },
    ToggleMute {
        reply: Reply<bool>,
    },
    ToggleCamera {
        reply: Reply<bool>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

pub struct CallService;

impl CallService {
    /// Starts the call loop for `local_id` on the current tokio runtime.
    pub async fn spawn(
        local_id: UserId,
        deps: CallDeps,
        config: CallConfig,
    ) -> Result<CallClient, CallError> {
        logger::init(&config);
        let buffer = config.command_buffer.max(1);
        let controller = CallController::start(local_id, deps, config).await?;
        let snapshot = controller.subscribe_snapshot();
        let streams = controller.subscribe_streams();
        let (commands, rx) = mpsc::channel(buffer);
        let task = tokio::spawn(run(controller, rx));
        Ok(CallClient {
            commands,
            snapshot,
            streams,
            task: Some(task),
        })
    }
}

async fn run(mut controller: CallController, mut commands: mpsc::Receiver<CallCommand>) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if let Some(done) = dispatch(&mut controller, command).await {
                        controller.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                }
                None => {
                    debug!("Call client dropped; stopping {}", controller.local_id());
                    controller.shutdown().await;
                    return;
                }
            },
            event = controller.next_event() => controller.handle(event).await,
        }
    }
}

/// Runs one command. Hands back the completion sender when the loop should stop.
async fn dispatch(
    controller: &mut CallController,
    command: CallCommand,
) -> Option<oneshot::Sender<()>> {
    // a caller that gave up on the reply is not an error
    match command {
        CallCommand::StartCall {
            target,
            kind,
            reply,
        } => {
            let _ = reply.send(controller.start_call(target, kind).await);
        }
        CallCommand::AcceptCall { reply } => {
            let _ = reply.send(controller.accept_call().await);
        }
        CallCommand::RejectCall { reply } => {
            let _ = reply.send(controller.reject_call().await);
        }
        CallCommand::HangUp { reply } => {
            let _ = reply.send(controller.hang_up().await);
        }
        CallCommand::ToggleMute { reply } => {
            let _ = reply.send(controller.toggle_mute());
        }
        CallCommand::ToggleCamera { reply } => {
            let _ = reply.send(controller.toggle_camera());
        }
        CallCommand::Shutdown { done } => return Some(done),
    }
    None
}

/// Handle on a running call loop. Dropping it hangs up and stops the loop.
pub struct CallClient {
    commands: mpsc::Sender<CallCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
    streams: watch::Receiver<RemoteStreams>,
    task: Option<JoinHandle<()>>,
}

impl CallClient {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> CallCommand,
    ) -> Result<T, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::Stopped)?;
        response.await.map_err(|_| CallError::Stopped)?
    }

    pub async fn start_call(
        &self,
        target: CallTarget,
        kind: MediaKind,
    ) -> Result<CallSession, CallError> {
        self.request(|reply| CallCommand::StartCall {
            target,
            kind,
            reply,
        })
        .await
    }

    pub async fn accept_call(&self) -> Result<CallSession, CallError> {
        self.request(|reply| CallCommand::AcceptCall { reply }).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::RejectCall { reply }).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::HangUp { reply }).await
    }

    /// Returns true when the microphone is now muted.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| CallCommand::ToggleMute { reply }).await
    }

    /// Returns true when the camera is now on.
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        self.request(|reply| CallCommand::ToggleCamera { reply }).await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn watch_streams(&self) -> watch::Receiver<RemoteStreams> {
        self.streams.clone()
    }

    /// Hangs up any call and waits for the loop to finish.
    pub async fn shutdown(mut self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(CallCommand::Shutdown { done }).await.is_ok() {
            let _ = finished.await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Call loop ended abnormally: {e}");
            }
        }
        info!("Call service stopped");
    }
}
