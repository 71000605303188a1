#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use httpreq::transport::Connect;
use httpreq::{Call, Error, Execution};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Everything a request handed back through its callbacks.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    data: Arc<Mutex<Vec<u8>>>,
    chunks: Arc<AtomicUsize>,
    errors: Arc<Mutex<Vec<Error>>>,
    completions: Arc<AtomicUsize>,
}

impl Outcome {
    pub fn start<C: Connect>(&self, call: Call<'_, C>) -> Execution {
        let data = self.data.clone();
        let chunks = self.chunks.clone();
        let errors = self.errors.clone();
        let completions = self.completions.clone();

        call.on_data(move |result| match result {
            Ok(bytes) => {
                chunks.fetch_add(1, Ordering::SeqCst);
                data.lock().extend_from_slice(&bytes);
            }
            Err(error) => errors.lock().push(error),
        })
        .on_complete(move || {
            completions.fetch_add(1, Ordering::SeqCst);
        })
        .start()
        .expect("request is valid")
    }

    pub fn data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }

    pub fn take_errors(&self) -> Vec<Error> {
        std::mem::take(&mut *self.errors.lock())
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

/// Read a request head, up to and including the blank line.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    head
}
