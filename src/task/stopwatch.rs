use std::time::{Duration, Instant};

use serde::Serialize;

/// A named point on a task's stopwatch.
#[derive(Debug, Clone, Serialize)]
pub struct Lap {
   pub label:   String,
   /// Time since the stopwatch started.
   #[serde(with = "millis")]
   pub elapsed: Duration,
}

/// Records named laps for profiling the sub-steps of a task.
#[derive(Debug)]
pub struct Stopwatch {
   start: Instant,
   laps:  Vec<Lap>,
}

impl Default for Stopwatch {
   fn default() -> Self {
      Self::new()
   }
}

impl Stopwatch {
   pub fn new() -> Self {
      Self { start: Instant::now(), laps: Vec::new() }
   }

   pub fn lap(&mut self, label: impl Into<String>) {
      self.laps.push(Lap { label: label.into(), elapsed: self.start.elapsed() });
   }

   pub fn laps(&self) -> &[Lap] {
      &self.laps
   }

   pub fn elapsed(&self) -> Duration {
      self.start.elapsed()
   }

   pub fn reset(&mut self) {
      self.start = Instant::now();
      self.laps.clear();
   }

   /// One line per lap with the time spent since the previous lap.
   pub fn report(&self) -> String {
      let mut prev = Duration::ZERO;
      let mut out = String::new();
      for lap in &self.laps {
         let step = lap.elapsed.saturating_sub(prev);
         prev = lap.elapsed;
         out.push_str(&format!("{}: {}ms\n", lap.label, step.as_millis()));
      }
      out
   }
}

mod millis {
   use std::time::Duration;

   use serde::Serializer;

   pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
      s.serialize_u64(d.as_millis() as u64)
   }
}
