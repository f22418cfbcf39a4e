//! Fixed-capacity ring buffer for hypervisor console output.

use std::collections::VecDeque;
use std::sync::Mutex;

type LineObserver = Box<dyn Fn(&str) + Send + Sync>;

pub struct RingLog {
    inner: Mutex<Inner>,
    observer: Mutex<Option<LineObserver>>,
}

struct Inner {
    capacity: usize,
    lines: VecDeque<String>,
    partial: String,
}

impl RingLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity,
                lines: VecDeque::with_capacity(capacity),
                partial: String::new(),
            }),
            observer: Mutex::new(None),
        }
    }

    pub fn set_observer<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.observer.lock().unwrap() = Some(Box::new(f));
    }

    /// Append a chunk of output. Completed lines enter the ring; a trailing
    /// fragment without a newline is carried into the next write.
    pub fn write(&self, chunk: &str) {
        let mut completed = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.partial.push_str(chunk);
            while let Some(pos) = inner.partial.find('\n') {
                let rest = inner.partial.split_off(pos + 1);
                let mut line = std::mem::replace(&mut inner.partial, rest);
                line.truncate(line.len() - 1);
                if inner.lines.len() == inner.capacity {
                    inner.lines.pop_front();
                }
                inner.lines.push_back(line.clone());
                completed.push(line);
            }
        }
        // Observers run without the buffer lock so they may log or take
        // application locks of their own.
        if !completed.is_empty() {
            let observer = self.observer.lock().unwrap();
            if let Some(f) = observer.as_ref() {
                for line in &completed {
                    f(line);
                }
            }
        }
    }

    pub fn lines(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.lines.iter().cloned().collect()
    }
}
