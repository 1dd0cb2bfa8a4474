//! Background thread decoding replacements and writing dumps.
//!
//! Requests are processed in order. Decoded replacements come back on a response channel
//! that the tracker drains without blocking.

use std::path::PathBuf;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use image::{ImageFormat, RgbaImage};
use tracing::{trace, warn};

use crate::TrackerError;
use crate::image_ops::{HdImage, load_replacement};

pub(crate) enum IoRequest {
    Load {
        hash: u32,
        palette_hash: u32,
        path: PathBuf,
    },
    Dump {
        path: PathBuf,
        image: RgbaImage,
    },
    /// Acknowledged once every earlier request has been handled.
    Sync(Sender<()>),
    Shutdown,
}

pub(crate) struct IoResponse {
    pub hash: u32,
    pub palette_hash: u32,
    pub image: HdImage,
}

pub(crate) struct IoWorker {
    requests: Sender<IoRequest>,
    responses: Receiver<IoResponse>,
    join_handle: Option<JoinHandle<()>>,
}

impl IoWorker {
    pub fn spawn() -> Result<Self, TrackerError> {
        let (requests, request_receiver) = unbounded();
        let (response_sender, responses) = unbounded();
        let join_handle = std::thread::Builder::new()
            .name("texture_io".to_owned())
            .spawn(move || io_loop(request_receiver, response_sender))
            .map_err(TrackerError::Spawn)?;
        Ok(Self {
            requests,
            responses,
            join_handle: Some(join_handle),
        })
    }

    pub fn send(&self, request: IoRequest) -> Result<(), TrackerError> {
        self.requests
            .send(request)
            .map_err(|_| TrackerError::WorkerDisconnected)
    }

    /// Every response that has arrived so far.
    pub fn drain(&self) -> Result<Vec<IoResponse>, TrackerError> {
        let mut responses = Vec::new();
        loop {
            match self.responses.try_recv() {
                Ok(response) => responses.push(response),
                Err(TryRecvError::Empty) => return Ok(responses),
                Err(TryRecvError::Disconnected) => {
                    return if responses.is_empty() {
                        Err(TrackerError::WorkerDisconnected)
                    } else {
                        Ok(responses)
                    };
                }
            }
        }
    }

    /// Blocks until the worker has handled every queued request.
    pub fn sync(&self) -> Result<(), TrackerError> {
        let (ack, done) = crossbeam_channel::bounded(1);
        self.send(IoRequest::Sync(ack))?;
        done.recv().map_err(|_| TrackerError::WorkerDisconnected)
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        let _ = self.requests.send(IoRequest::Shutdown);
        if let Some(join_handle) = self.join_handle.take()
            && join_handle.join().is_err()
        {
            warn!("[tracker] io thread panicked");
        }
    }
}

fn io_loop(requests: Receiver<IoRequest>, responses: Sender<IoResponse>) {
    trace!("[tracker] io thread starting");
    for request in requests.iter() {
        match request {
            IoRequest::Load {
                hash,
                palette_hash,
                path,
            } => {
                let image = match load_replacement(&path) {
                    Ok(image) => image,
                    Err(error) => {
                        warn!("[tracker] failed to load {}: {error}", path.display());
                        continue;
                    }
                };
                trace!("[tracker] loaded {:x}-{:x}", hash, palette_hash);
                let response = IoResponse {
                    hash,
                    palette_hash,
                    image,
                };
                if responses.send(response).is_err() {
                    break;
                }
            }
            IoRequest::Dump { path, image } => {
                if let Err(error) = image.save_with_format(&path, ImageFormat::Png) {
                    warn!("[tracker] failed to write {}: {error}", path.display());
                }
            }
            IoRequest::Sync(ack) => {
                let _ = ack.send(());
            }
            IoRequest::Shutdown => break,
        }
    }
    trace!("[tracker] io thread ending");
}
