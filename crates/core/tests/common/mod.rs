//! Shared fakes for the integration tests.
//!
//! `FakeEngine` stands in for a real-time media stack: it records every
//! call and, once a local description is installed, "gathers" a fixed
//! number of candidates named after itself so tests can tell whose
//! candidate ended up where.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use signalcast::{
    CandidateStream, IceCandidate, MediaEngine, MediaEngineFactory, MediaSource, MediaTrack,
    Result, SessionDescription, SignalError,
};

#[derive(Debug, Default, Clone)]
pub struct EngineLog {
    pub name: String,
    pub calls: Vec<String>,
    pub remote_sdps: Vec<String>,
    pub applied: Vec<String>,
    pub tracks: Vec<String>,
}

pub type SharedLog = Arc<Mutex<EngineLog>>;

pub struct FakeEngine {
    log: SharedLog,
    candidates: mpsc::UnboundedSender<Option<IceCandidate>>,
    gather: usize,
    locals: u32,
}

impl FakeEngine {
    fn name(&self) -> String {
        self.log.lock().name.clone()
    }
}

impl MediaEngine for FakeEngine {
    async fn create_offer(&mut self) -> Result<SessionDescription> {
        let name = self.name();
        self.log.lock().calls.push("create_offer".to_string());
        Ok(SessionDescription::offer(format!(
            "offer from {name} #{}",
            self.locals + 1
        )))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription> {
        let name = self.name();
        self.log.lock().calls.push("create_answer".to_string());
        Ok(SessionDescription::answer(format!(
            "answer from {name} #{}",
            self.locals + 1
        )))
    }

    async fn set_local_description(&mut self, desc: &SessionDescription) -> Result<()> {
        self.locals += 1;
        let name = self.name();
        self.log.lock().calls.push(format!("set_local {}", desc.sdp));
        for i in 0..self.gather {
            let candidate = IceCandidate::new(format!("candidate:{name}-{}-{i}", self.locals));
            let _ = self.candidates.send(Some(candidate));
        }
        let _ = self.candidates.send(None);
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<()> {
        let mut log = self.log.lock();
        log.calls.push(format!("set_remote {}", desc.sdp));
        log.remote_sdps.push(desc.sdp.clone());
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        let mut log = self.log.lock();
        if log.remote_sdps.is_empty() {
            return Err(SignalError::Engine(
                "candidate before remote description".to_string(),
            ));
        }
        log.calls.push(format!("add_candidate {}", candidate.candidate));
        log.applied.push(candidate.candidate.clone());
        Ok(())
    }

    async fn add_track(&mut self, track: &MediaTrack) -> Result<()> {
        let mut log = self.log.lock();
        log.calls.push(format!("add_track {}", track.id));
        log.tracks.push(track.id.clone());
        Ok(())
    }
}

/// Creates `FakeEngine`s named `<prefix><n>` and keeps their logs.
#[derive(Clone)]
pub struct FakeFactory {
    prefix: String,
    gather: usize,
    logs: Arc<Mutex<Vec<SharedLog>>>,
}

impl FakeFactory {
    pub fn new(prefix: &str, gather: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            gather,
            logs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn logs(&self) -> Vec<EngineLog> {
        self.logs.lock().iter().map(|log| log.lock().clone()).collect()
    }

    pub fn log(&self, index: usize) -> Option<EngineLog> {
        self.logs.lock().get(index).map(|log| log.lock().clone())
    }
}

impl MediaEngineFactory for FakeFactory {
    type Engine = FakeEngine;

    fn create(&self) -> Result<(FakeEngine, CandidateStream)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut logs = self.logs.lock();
        let log = Arc::new(Mutex::new(EngineLog {
            name: format!("{}{}", self.prefix, logs.len()),
            ..EngineLog::default()
        }));
        logs.push(log.clone());
        Ok((
            FakeEngine {
                log,
                candidates: tx,
                gather: self.gather,
                locals: 0,
            },
            rx,
        ))
    }
}

pub struct FakeSource {
    tracks: Vec<MediaTrack>,
    deny: bool,
}

impl FakeSource {
    pub fn with(tracks: Vec<MediaTrack>) -> Self {
        Self {
            tracks,
            deny: false,
        }
    }

    pub fn denied() -> Self {
        Self {
            tracks: Vec::new(),
            deny: true,
        }
    }
}

impl MediaSource for FakeSource {
    async fn acquire(&mut self) -> Result<Vec<MediaTrack>> {
        if self.deny {
            return Err(SignalError::MediaUnavailable(
                "permission denied".to_string(),
            ));
        }
        Ok(std::mem::take(&mut self.tracks))
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
