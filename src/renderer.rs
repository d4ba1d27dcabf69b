//! # LED Strip Text Rendering
//!
//! Renders a [`TideReading`] as one character per LED, for development without
//! the physical strip. The layout matches the hardware strip:
//!
//! ```text
//! index 0           middle LEDs                 index n-1
//!   G   P P P P B B B B B B B B B B B B B B B B B   *
//!   ^   ^ purple (not yet reached)      blue ^      ^ bottom: R when falling
//!   top: G when rising                  last middle LED is always blue
//! ```
//!
//! When no tide data is available the whole strip blinks red.

use crate::calculator::{Direction, TideCalculator, TideReading};
use crate::scheduler::DataListener;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const OFF: char = '*';
const GREEN: char = 'G';
const RED: char = 'R';
const BLUE: char = 'B';
const PURPLE: char = 'P';

/// Smallest strip that still has a middle section.
const MIN_LEDS: usize = 4;

/// Render one frame of the strip.
///
/// `blink_on` only matters for [`TideReading::Unavailable`]: all red when true,
/// all off when false.
pub fn render_strip(reading: &TideReading, led_count: usize, blink_on: bool) -> String {
    let led_count = led_count.max(MIN_LEDS);

    let state = match reading {
        TideReading::Available(state) => state,
        TideReading::Unavailable { .. } => {
            let c = if blink_on { RED } else { OFF };
            return std::iter::repeat(c).take(led_count).collect();
        }
    };

    let mut strip = vec![OFF; led_count];
    match state.direction {
        Direction::Rising => strip[0] = GREEN,
        Direction::Falling => strip[led_count - 1] = RED,
    }

    // Middle LEDs are 1..=led_count-2; the last of them is the fixed blue reference.
    let middle = led_count - 2;
    let fillable = middle - 1;
    let blue = ((state.progress * fillable as f64) as usize).min(fillable);
    let reference = led_count - 2;
    strip[reference] = BLUE;
    for i in 0..fillable {
        // Fill upwards from just above the reference LED
        let index = reference - 1 - i;
        strip[index] = if i < blue { BLUE } else { PURPLE };
    }

    strip.into_iter().collect()
}

/// Text render loop driven by the calculator.
///
/// Prints a frame only when it differs from the previous one. Registered as a
/// [`DataListener`] so that new tide data forces a redraw.
#[derive(Debug)]
pub struct TextVisualizer {
    led_count: usize,
    tick: Duration,
    blink: Duration,
    dirty: AtomicBool,
}

impl TextVisualizer {
    pub fn new(led_count: usize, tick: Duration, blink: Duration) -> Self {
        Self {
            led_count,
            tick,
            blink,
            dirty: AtomicBool::new(true),
        }
    }

    /// Frame for the current reading, or `None` if nothing needs printing.
    pub fn next_frame(
        &self,
        reading: &TideReading,
        blink_on: bool,
        previous: Option<&str>,
    ) -> Option<String> {
        let frame = render_strip(reading, self.led_count, blink_on);
        let forced = self.dirty.swap(false, Ordering::SeqCst);
        if forced || previous != Some(frame.as_str()) {
            Some(frame)
        } else {
            None
        }
    }

    /// Run the render loop on stdout until the task is aborted or stdout closes.
    pub async fn run(&self, calculator: TideCalculator) {
        self.run_to(calculator, io::stdout()).await
    }

    /// Render loop writing frames to `out`. Returns when a write fails.
    pub async fn run_to<W: Write + Send>(&self, calculator: TideCalculator, mut out: W) {
        let mut ticker = tokio::time::interval(self.tick);
        let mut previous: Option<String> = None;
        let mut last_direction: Option<Direction> = None;
        let mut blink_on = false;
        let mut last_blink = Instant::now();

        loop {
            ticker.tick().await;
            let reading = calculator.current();

            if reading.is_available() {
                blink_on = false;
            } else if last_blink.elapsed() >= self.blink {
                blink_on = !blink_on;
                last_blink = Instant::now();
            }

            if let Some(state) = reading.state() {
                if last_direction.is_some_and(|d| d != state.direction) {
                    info!(direction = %state.direction, "tide direction changed");
                }
                last_direction = Some(state.direction);
            }

            if let Some(frame) = self.next_frame(&reading, blink_on, previous.as_deref()) {
                if let Err(e) = writeln!(out, "[LED] {frame}").and_then(|()| out.flush()) {
                    debug!(error = %e, "frame output closed, stopping render loop");
                    return;
                }
                previous = Some(frame);
            }
        }
    }
}

impl DataListener for TextVisualizer {
    fn on_tide_data_updated(&self) {
        info!("tide data updated, refreshing visualization");
        self.dirty.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{TideState, UnavailableReason};
    use crate::event_store::EventStore;
    use std::sync::Arc;
    use crate::{TideFlag, WaterLevelEvent};
    use chrono::{TimeZone, Utc};

    fn reading(direction: Direction, progress: f64) -> TideReading {
        let (last, next) = match direction {
            Direction::Rising => (TideFlag::Low, TideFlag::High),
            Direction::Falling => (TideFlag::High, TideFlag::Low),
        };
        TideReading::Available(TideState {
            direction,
            progress,
            last_event: WaterLevelEvent::new(Utc.timestamp_opt(0, 0).unwrap(), last),
            next_event: WaterLevelEvent::new(Utc.timestamp_opt(100, 0).unwrap(), next),
        })
    }

    fn unavailable() -> TideReading {
        TideReading::Unavailable {
            reason: UnavailableReason::NoData,
        }
    }

    #[test]
    fn rising_half_way() {
        // 10 LEDs: 8 middle, 7 fillable, floor(0.5 * 7) = 3 blue above the reference
        assert_eq!(render_strip(&reading(Direction::Rising, 0.5), 10, false), "GPPPPBBBB*");
    }

    #[test]
    fn falling_extremes() {
        assert_eq!(render_strip(&reading(Direction::Falling, 0.0), 10, false), "*PPPPPPPBR");
        assert_eq!(render_strip(&reading(Direction::Falling, 1.0), 10, false), "*BBBBBBBBR");
    }

    #[test]
    fn unavailable_blinks_red() {
        assert_eq!(render_strip(&unavailable(), 6, true), "RRRRRR");
        assert_eq!(render_strip(&unavailable(), 6, false), "******");
    }

    #[test]
    fn strip_length_matches_led_count() {
        for count in [4, 5, 30, 60, 144] {
            for p in [0.0, 0.25, 0.99, 1.0] {
                assert_eq!(
                    render_strip(&reading(Direction::Rising, p), count, false)
                        .chars()
                        .count(),
                    count
                );
            }
        }
        // Tiny strips are padded to the minimum layout
        assert_eq!(render_strip(&unavailable(), 1, true).len(), MIN_LEDS);
    }

    #[test]
    fn frames_print_on_change_or_after_data_update() {
        let vis = TextVisualizer::new(10, Duration::from_millis(100), Duration::from_millis(500));
        let r = reading(Direction::Rising, 0.5);

        let first = vis.next_frame(&r, false, None).unwrap();
        assert_eq!(vis.next_frame(&r, false, Some(&first)), None);

        vis.on_tide_data_updated();
        assert_eq!(vis.next_frame(&r, false, Some(&first)), Some(first.clone()));

        let moved = reading(Direction::Rising, 0.9);
        assert!(vis.next_frame(&moved, false, Some(&first)).is_some());
    }

    struct ClosedOutput;

    impl Write for ClosedOutput {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn render_loop_stops_when_output_fails() {
        let vis = TextVisualizer::new(10, Duration::from_millis(1), Duration::from_millis(5));
        let calculator = TideCalculator::new(Arc::new(EventStore::in_memory()));

        tokio::time::timeout(Duration::from_secs(5), vis.run_to(calculator, ClosedOutput))
            .await
            .expect("render loop should return on a write error");
    }

    #[tokio::test]
    async fn render_loop_writes_frames() {
        let vis = TextVisualizer::new(6, Duration::from_millis(1), Duration::from_millis(5));
        let calculator = TideCalculator::new(Arc::new(EventStore::in_memory()));
        let mut out = Vec::new();

        let run = vis.run_to(calculator, &mut out);
        let _ = tokio::time::timeout(Duration::from_millis(30), run).await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().next().is_some_and(|l| l.starts_with("[LED] ")));
    }
}
