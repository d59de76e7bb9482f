//! Background metadata scanning: requests and the bounded worker pool.
//!
//! The core queues one [`ScanRequest`] per unscanned entry and hands it to
//! the pool, except for the single playback-tagged request, which the
//! playback thread runs synchronously. Either way the finished request is
//! routed back through the core's `scan_finish`.

use std::fs::File;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use lofty::file::{AudioFile, FileType, TaggedFile, TaggedFileExt};
use lofty::prelude::Accessor;
use lofty::read_from_path;
use log::{debug, warn};

use crate::protocol::{Decoder, Tuple};

/// Worker threads serving background scans.
pub(crate) const SCAN_THREADS: usize = 2;

pub(crate) const SCAN_TUPLE: u32 = 1 << 0;
pub(crate) const SCAN_IMAGE: u32 = 1 << 1;
pub(crate) const SCAN_FILE: u32 = 1 << 2;

/// One unit of scan work.
///
/// Built by the core under its lock, run with no locks held, then matched
/// back to its scan-list item by `serial`.
pub(crate) struct ScanRequest {
    pub serial: u64,
    pub filename: String,
    pub flags: u32,
    pub decoder: Option<Decoder>,
    /// On input, a still-valid tuple to reuse; on output, the scanned one.
    pub tuple: Option<Tuple>,
    pub error: Option<String>,
    pub image_data: Option<Vec<u8>>,
    pub image_file: Option<PathBuf>,
    pub file: Option<File>,
}

impl ScanRequest {
    pub fn new(
        serial: u64,
        filename: &str,
        flags: u32,
        decoder: Option<Decoder>,
        tuple: Option<Tuple>,
    ) -> Self {
        ScanRequest {
            serial,
            filename: filename.to_string(),
            flags,
            decoder,
            tuple,
            error: None,
            image_data: None,
            image_file: None,
            file: None,
        }
    }

    /// Performs the reads requested by `flags`.
    pub fn run(&mut self) {
        match read_from_path(&self.filename) {
            Ok(tagged) => {
                if self.decoder.is_none() {
                    self.decoder = Some(decoder_for(tagged.file_type()));
                }
                if self.flags & SCAN_TUPLE != 0 {
                    self.tuple = Some(tuple_from_tagged(&self.filename, &tagged));
                }
                if self.flags & SCAN_IMAGE != 0 {
                    self.image_data = tagged
                        .primary_tag()
                        .or_else(|| tagged.first_tag())
                        .and_then(|tag| tag.pictures().first())
                        .map(|picture| picture.data().to_vec());
                }
            }
            Err(err) => {
                self.error = Some(format!("{}: {}", self.filename, err));
            }
        }

        if self.flags & SCAN_FILE != 0 {
            match File::open(&self.filename) {
                Ok(file) => self.file = Some(file),
                Err(err) => {
                    if self.error.is_none() {
                        self.error = Some(format!("{}: {}", self.filename, err));
                    }
                }
            }
        }
    }
}

fn decoder_for(file_type: FileType) -> Decoder {
    let name = match file_type {
        FileType::Aac => "aac",
        FileType::Aiff => "aiff",
        FileType::Ape => "ape",
        FileType::Flac => "flac",
        FileType::Mpeg => "mpeg",
        FileType::Mp4 => "mp4",
        FileType::Opus => "opus",
        FileType::Speex => "speex",
        FileType::Vorbis => "vorbis",
        FileType::Wav => "wav",
        FileType::WavPack => "wavpack",
        _ => "probe",
    };
    Decoder { name }
}

fn tuple_from_tagged(filename: &str, tagged: &TaggedFile) -> Tuple {
    let mut tuple = Tuple::default();

    if let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) {
        tuple.title = tag.title().map(|value| value.into_owned());
        tuple.artist = tag.artist().map(|value| value.into_owned());
        tuple.album = tag.album().map(|value| value.into_owned());
        tuple.genre = tag.genre().map(|value| value.into_owned());
        tuple.year = tag.year();
        tuple.track_number = tag.track();
    }

    if tuple.title.is_none() {
        tuple.title = Tuple::from_filename(filename).title;
    }
    tuple.length_ms = Some(tagged.properties().duration().as_millis() as u64);
    tuple
}

/// Fixed pool of scanner workers fed over a single shared channel.
pub(crate) struct ScannerPool {
    tx: Mutex<Option<Sender<ScanRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ScannerPool {
    /// Spawns the workers. Each runs its request to completion, then hands
    /// it to `finish` (the core's `scan_finish`).
    pub fn spawn(finish: Arc<dyn Fn(ScanRequest) + Send + Sync>) -> Self {
        let (tx, rx) = channel::<ScanRequest>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(SCAN_THREADS);
        for worker in 0..SCAN_THREADS {
            let rx = Arc::clone(&rx);
            let finish = Arc::clone(&finish);
            workers.push(std::thread::spawn(move || loop {
                let request = rx.lock().unwrap().recv();
                let Ok(mut request) = request else { break };
                debug!("Scanner: worker {} reading {}", worker, request.filename);
                request.run();
                finish(request);
            }));
        }

        ScannerPool {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    pub fn dispatch(&self, request: ScanRequest) {
        let tx = self.tx.lock().unwrap();
        let Some(tx) = tx.as_ref() else {
            warn!("Scanner: request for {} after shutdown", request.filename);
            return;
        };
        let _ = tx.send(request);
    }

    /// Drains the pool: closes the channel and joins the workers.
    pub fn stop(&self) {
        self.tx.lock().unwrap().take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for ScannerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn run_records_an_error_for_a_missing_file() {
        let mut request = ScanRequest::new(1, "/nonexistent/track.flac", SCAN_TUPLE, None, None);
        request.run();
        assert!(request.error.is_some());
        assert!(request.tuple.is_none());
    }

    #[test]
    fn run_keeps_a_reused_tuple_when_not_asked_to_scan() {
        let tuple = Tuple {
            title: Some("Kept".to_string()),
            ..Tuple::default()
        };
        let mut request = ScanRequest::new(2, "/nonexistent/track.flac", 0, None, Some(tuple));
        request.run();
        assert_eq!(
            request.tuple.as_ref().and_then(|t| t.title.as_deref()),
            Some("Kept")
        );
    }

    #[test]
    fn pool_routes_finished_requests_back() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let pool = ScannerPool::spawn(Arc::new(move |request: ScanRequest| {
            assert!(request.error.is_some());
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        for serial in 0..4 {
            pool.dispatch(ScanRequest::new(
                serial,
                "/nonexistent/track.flac",
                SCAN_TUPLE,
                None,
                None,
            ));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while finished.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        pool.stop();
    }
}
