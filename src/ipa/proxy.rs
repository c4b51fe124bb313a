// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Runs an algorithm engine on its own thread.
//!
//! Lifecycle calls are forwarded to the worker and wait for its answer.
//! Events are queued without waiting; the engine answers them by posting
//! actions to the camera's event loop. If the engine fails to map buffers it
//! is torn down and every later call reports [`HalError::HardwareFatal`].

use super::{IpaBuffer, IpaEvent, IpaInterface, IpaStream, SensorInfo};
use crate::{
    controls::ControlInfoMap,
    error::{HalError, Result},
    request::StreamId,
};
use kanal::{Receiver, Sender};
use std::{
    collections::BTreeMap,
    thread::{self, JoinHandle},
};
use tracing::{debug, error, warn};

type Reply = Sender<Result<()>>;

enum Command {
    Init {
        hw_revision: u32,
        reply: Reply,
    },
    Start {
        reply: Reply,
    },
    Stop {
        reply: Reply,
    },
    Configure {
        sensor: SensorInfo,
        streams: BTreeMap<StreamId, IpaStream>,
        entity_controls: BTreeMap<u32, ControlInfoMap>,
        reply: Reply,
    },
    MapBuffers {
        buffers: Vec<IpaBuffer>,
        reply: Reply,
    },
    UnmapBuffers {
        ids: Vec<u32>,
        reply: Reply,
    },
    Event(IpaEvent),
    Shutdown,
}

pub struct IpaProxy {
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

fn engine_gone() -> HalError {
    HalError::HardwareFatal("algorithm engine is not running".into())
}

fn run(mut ipa: Box<dyn IpaInterface>, commands: Receiver<Command>) {
    while let Ok(command) = commands.recv() {
        match command {
            Command::Init { hw_revision, reply } => {
                let _ = reply.send(ipa.init(hw_revision));
            }
            Command::Start { reply } => {
                let _ = reply.send(ipa.start());
            }
            Command::Stop { reply } => {
                ipa.stop();
                let _ = reply.send(Ok(()));
            }
            Command::Configure {
                sensor,
                streams,
                entity_controls,
                reply,
            } => {
                let _ = reply.send(ipa.configure(&sensor, &streams, &entity_controls));
            }
            Command::MapBuffers { buffers, reply } => {
                let result = ipa.map_buffers(buffers);
                let failed = result.is_err();
                let _ = reply.send(result);
                if failed {
                    error!("buffer mapping failed, tearing down algorithm engine");
                    break;
                }
            }
            Command::UnmapBuffers { ids, reply } => {
                ipa.unmap_buffers(&ids);
                let _ = reply.send(Ok(()));
            }
            Command::Event(event) => ipa.process_event(event),
            Command::Shutdown => break,
        }
    }

    let _ = commands.close();
    debug!("algorithm engine thread exiting");
}

impl IpaProxy {
    /// Moves `ipa` to a new worker thread.
    pub fn spawn<I: IpaInterface + 'static>(ipa: I) -> Result<Self> {
        let (commands, rx) = kanal::unbounded();
        let worker = thread::Builder::new()
            .name("ipa".into())
            .spawn(move || run(Box::new(ipa), rx))?;
        Ok(Self {
            commands,
            worker: Some(worker),
        })
    }

    /// False once the engine has been torn down.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    fn call(&self, command: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (reply, answer) = kanal::bounded(1);
        self.commands
            .send(command(reply))
            .map_err(|_| engine_gone())?;
        answer.recv().map_err(|_| engine_gone())?
    }
}

impl IpaInterface for IpaProxy {
    fn init(&mut self, hw_revision: u32) -> Result<()> {
        self.call(|reply| Command::Init { hw_revision, reply })
    }

    fn start(&mut self) -> Result<()> {
        self.call(|reply| Command::Start { reply })
    }

    fn stop(&mut self) {
        if let Err(e) = self.call(|reply| Command::Stop { reply }) {
            warn!("stopping algorithm engine: {e}");
        }
    }

    fn configure(
        &mut self,
        sensor: &SensorInfo,
        streams: &BTreeMap<StreamId, IpaStream>,
        entity_controls: &BTreeMap<u32, ControlInfoMap>,
    ) -> Result<()> {
        self.call(|reply| Command::Configure {
            sensor: sensor.clone(),
            streams: streams.clone(),
            entity_controls: entity_controls.clone(),
            reply,
        })
    }

    fn map_buffers(&mut self, buffers: Vec<IpaBuffer>) -> Result<()> {
        self.call(|reply| Command::MapBuffers { buffers, reply })
    }

    fn unmap_buffers(&mut self, ids: &[u32]) {
        if let Err(e) = self.call(|reply| Command::UnmapBuffers {
            ids: ids.to_vec(),
            reply,
        }) {
            warn!("unmapping algorithm buffers: {e}");
        }
    }

    fn process_event(&mut self, event: IpaEvent) {
        if self.commands.send(Command::Event(event)).is_err() {
            error!("algorithm engine is gone, dropping event");
        }
    }
}

impl Drop for IpaProxy {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("algorithm engine thread panicked");
            }
        }
    }
}
