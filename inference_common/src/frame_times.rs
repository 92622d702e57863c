use std::time::Duration;

/// Time spent in each stage for a single frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameTimes {
    pub decode: Duration,
    pub detect: Duration,
    pub annotate: Duration,
    pub encode: Duration,
}

impl FrameTimes {
    pub fn total(&self) -> Duration {
        self.decode + self.detect + self.annotate + self.encode
    }
}

/// Per-frame times of a whole run.
#[derive(Debug, Default)]
pub struct AggregatedTimes {
    frames: Vec<FrameTimes>,
}

impl AggregatedTimes {
    pub fn push(&mut self, times: FrameTimes) {
        self.frames.push(times);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn sample(&self, skip_first: bool) -> &[FrameTimes] {
        // the first frame pays for lazy init in the decoder and the model
        if skip_first && self.frames.len() > 1 {
            &self.frames[1..]
        } else {
            &self.frames
        }
    }

    pub fn avg(&self, skip_first: bool) -> FrameTimes {
        let frames = self.sample(skip_first);
        if frames.is_empty() {
            return FrameTimes::default();
        }
        let n = frames.len() as u32;
        let sum = frames.iter().fold(FrameTimes::default(), |acc, t| FrameTimes {
            decode: acc.decode + t.decode,
            detect: acc.detect + t.detect,
            annotate: acc.annotate + t.annotate,
            encode: acc.encode + t.encode,
        });
        FrameTimes {
            decode: sum.decode / n,
            detect: sum.detect / n,
            annotate: sum.annotate / n,
            encode: sum.encode / n,
        }
    }

    pub fn min(&self, skip_first: bool) -> FrameTimes {
        self.fold(skip_first, Duration::min)
    }

    pub fn max(&self, skip_first: bool) -> FrameTimes {
        self.fold(skip_first, Duration::max)
    }

    fn fold(&self, skip_first: bool, pick: fn(Duration, Duration) -> Duration) -> FrameTimes {
        let frames = self.sample(skip_first);
        let Some(first) = frames.first().copied() else {
            return FrameTimes::default();
        };
        frames.iter().skip(1).fold(first, |acc, t| FrameTimes {
            decode: pick(acc.decode, t.decode),
            detect: pick(acc.detect, t.detect),
            annotate: pick(acc.annotate, t.annotate),
            encode: pick(acc.encode, t.encode),
        })
    }
}
