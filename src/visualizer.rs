//! # Visualizer
//!
//! Radial spectrum display of both sides of the conversation: the microphone
//! on an inner ring, the assistant's voice on an outer ring, one bar per
//! frequency bin.
//!
//! The draw loop only reads the signal taps through the analysers. Nothing
//! in the session depends on whether, or how fast, frames are drawn.

use crate::audio::analyser::SpectralAnalyser;
use std::f32::consts::TAU;
use std::io::{self, Write};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{trace, warn};

/// Share of `min(width, height)` used as the base radius.
const BASE_RADIUS_FACTOR: f32 = 0.3;

/// Drawing surface size, in renderer units (terminal cells for the terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u16,
    pub height: u16,
}

impl FromStr for Viewport {
    type Err = String;

    /// Parses `WIDTHxHEIGHT`, e.g. `80x40`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(|c: char| c.eq_ignore_ascii_case(&'x'))
            .ok_or_else(|| format!("Expected WIDTHxHEIGHT, got: {}", s.trim()))?;
        let width: u16 = w.trim().parse().map_err(|_| format!("Invalid width: {}", w))?;
        let height: u16 = h.trim().parse().map_err(|_| format!("Invalid height: {}", h))?;
        if width == 0 || height == 0 {
            return Err("Viewport dimensions must be greater than 0".to_string());
        }
        Ok(Viewport { width, height })
    }
}

/// One spectrum bar, pointing outward from its ring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    /// Direction in radians, `2π·i / bins`
    pub angle: f32,
    /// Distance from the centre where the bar starts
    pub radius: f32,
    /// Bar length, proportional to `magnitude / 255`
    pub length: f32,
    pub magnitude: u8,
}

impl Bar {
    /// Outer end point of the bar relative to `center`.
    pub fn tip(&self, center: (f32, f32)) -> (f32, f32) {
        let reach = self.radius + self.length;
        (center.0 + reach * self.angle.cos(), center.1 + reach * self.angle.sin())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ring {
    pub radius: f32,
    pub bars: Vec<Bar>,
    /// Mean bin magnitude in [0, 1]
    pub level: f32,
}

/// Everything a renderer needs for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualFrame {
    pub viewport: Viewport,
    pub center: (f32, f32),
    pub input: Ring,
    pub output: Ring,
}

pub struct Visualizer {
    input: SpectralAnalyser,
    output: SpectralAnalyser,
    viewport: Viewport,
    center: (f32, f32),
    base_radius: f32,
}

impl Visualizer {
    pub fn new(input: SpectralAnalyser, output: SpectralAnalyser, viewport: Viewport) -> Self {
        let mut visualizer = Self {
            input,
            output,
            viewport,
            center: (0.0, 0.0),
            base_radius: 0.0,
        };
        visualizer.resize(viewport.width, viewport.height);
        visualizer
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn center(&self) -> (f32, f32) {
        self.center
    }

    pub fn base_radius(&self) -> f32 {
        self.base_radius
    }

    /// Recompute the circle geometry for a new surface size.
    pub fn resize(&mut self, width: u16, height: u16) {
        self.viewport = Viewport { width, height };
        let (w, h) = (f32::from(width), f32::from(height));
        self.center = (w / 2.0, h / 2.0);
        self.base_radius = BASE_RADIUS_FACTOR * w.min(h);
    }

    /// Refresh both analysers and lay out the bars.
    pub fn draw_frame(&mut self) -> VisualFrame {
        self.input.update();
        self.output.update();

        // Inner ring hugs the centre, outer ring sits on the base radius
        let inner = Self::ring(&self.input, self.base_radius * 0.5, self.base_radius * 0.45);
        let outer = Self::ring(&self.output, self.base_radius, self.base_radius * 0.6);

        VisualFrame {
            viewport: self.viewport,
            center: self.center,
            input: inner,
            output: outer,
        }
    }

    fn ring(analyser: &SpectralAnalyser, radius: f32, max_length: f32) -> Ring {
        let data = analyser.data();
        let bins = analyser.frequency_bin_count().max(1) as f32;
        let bars = data
            .iter()
            .enumerate()
            .map(|(i, &magnitude)| Bar {
                angle: TAU * i as f32 / bins,
                radius,
                length: max_length * f32::from(magnitude) / 255.0,
                magnitude,
            })
            .collect();
        Ring {
            radius,
            bars,
            level: analyser.level(),
        }
    }
}

/// Presents visual frames somewhere.
pub trait Renderer: Send {
    fn render(&mut self, frame: &VisualFrame) -> io::Result<()>;
}

/// Emits ring levels as trace events. Useful with `RUST_LOG=...=trace`.
#[derive(Debug, Default)]
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn render(&mut self, frame: &VisualFrame) -> io::Result<()> {
        trace!(
            input_level = frame.input.level,
            output_level = frame.output.level,
            "Visual frame"
        );
        Ok(())
    }
}

/// Rasterises the rings into a character grid and redraws it in place.
pub struct TerminalRenderer<W: Write + Send> {
    out: W,
    grid: Vec<Vec<char>>,
}

impl<W: Write + Send> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out, grid: Vec::new() }
    }

    fn plot_ring(&mut self, ring: &Ring, center: (f32, f32), glyph: char) {
        for bar in &ring.bars {
            let (dx, dy) = (bar.angle.cos(), bar.angle.sin());
            // The ring itself, then the bar in half-cell steps
            let steps = (bar.length * 2.0).ceil() as usize;
            for step in 0..=steps {
                let reach = bar.radius + step as f32 * 0.5;
                let (x, y) = (center.0 + reach * dx, center.1 + reach * dy);
                let ch = if step == 0 { '.' } else { glyph };
                self.set(x, y, ch);
            }
            if bar.magnitude > 0 {
                let (x, y) = bar.tip(center);
                self.set(x, y, glyph);
            }
        }
    }

    fn set(&mut self, x: f32, y: f32, ch: char) {
        if x < 0.0 || y < 0.0 {
            return;
        }
        let (col, row) = (x as usize, y as usize);
        if let Some(cell) = self.grid.get_mut(row).and_then(|line| line.get_mut(col)) {
            // Bars win over the ring outline
            if *cell == ' ' || *cell == '.' {
                *cell = ch;
            }
        }
    }
}

impl<W: Write + Send> Renderer for TerminalRenderer<W> {
    fn render(&mut self, frame: &VisualFrame) -> io::Result<()> {
        let (width, height) = (usize::from(frame.viewport.width), usize::from(frame.viewport.height));
        self.grid.resize(height, Vec::new());
        for line in &mut self.grid {
            line.clear();
            line.resize(width, ' ');
        }

        self.plot_ring(&frame.output, frame.center, '#');
        self.plot_ring(&frame.input, frame.center, '*');

        // Cursor home, then overwrite the previous frame
        write!(self.out, "\x1b[H")?;
        for line in &self.grid {
            let text: String = line.iter().collect();
            writeln!(self.out, "{}", text)?;
        }
        writeln!(
            self.out,
            "mic {:>3.0}%  voice {:>3.0}%",
            frame.input.level * 100.0,
            frame.output.level * 100.0
        )?;
        self.out.flush()
    }
}

/// Draw loop: one frame per tick at `fps`, skipping ticks that were missed
/// rather than bursting to catch up. Viewport changes are applied before the
/// next frame. Ends when the viewport sender is dropped or rendering fails.
pub async fn run(
    mut visualizer: Visualizer,
    mut renderer: Box<dyn Renderer>,
    fps: u32,
    mut viewport: watch::Receiver<Viewport>,
) {
    let period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        match viewport.has_changed() {
            Ok(true) => {
                let size = *viewport.borrow_and_update();
                visualizer.resize(size.width, size.height);
            }
            Ok(false) => {}
            Err(_) => return,
        }

        let frame = visualizer.draw_frame();
        if let Err(e) = renderer.render(&frame) {
            warn!(error = %e, "Visualizer stopped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tap::SignalTap;

    fn visualizer(width: u16, height: u16) -> (Visualizer, SignalTap, SignalTap) {
        let input = SignalTap::new("input", 256);
        let output = SignalTap::new("output", 256);
        let v = Visualizer::new(
            SpectralAnalyser::new(input.clone()),
            SpectralAnalyser::new(output.clone()),
            Viewport { width, height },
        );
        (v, input, output)
    }

    fn tone(bin: f32) -> Vec<f32> {
        (0..256)
            .map(|n| (TAU * bin * n as f32 / 256.0).sin() * 0.05)
            .collect()
    }

    #[test]
    fn test_resize_recomputes_geometry() {
        let (mut v, _, _) = visualizer(100, 50);
        assert_eq!(v.center(), (50.0, 25.0));
        assert!((v.base_radius() - 15.0).abs() < 1e-6);

        v.resize(40, 80);
        assert_eq!(v.center(), (20.0, 40.0));
        assert!((v.base_radius() - 12.0).abs() < 1e-6);
    }

    #[test]
    fn test_silent_frame_has_flat_bars() {
        let (mut v, _, _) = visualizer(64, 32);
        let frame = v.draw_frame();

        assert_eq!(frame.input.bars.len(), 128);
        assert_eq!(frame.output.bars.len(), 128);
        assert!(frame.output.bars.iter().all(|b| b.length == 0.0));
        assert!(frame.input.radius < frame.output.radius);
        assert!((frame.output.bars[32].angle - TAU / 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_output_signal_raises_outer_ring_only() {
        let (mut v, _, output) = visualizer(64, 32);
        output.push_slice(&tone(16.0));
        for _ in 0..20 {
            v.draw_frame();
        }
        let frame = v.draw_frame();

        assert!(frame.output.level > 0.0);
        assert_eq!(frame.input.level, 0.0);
        let longest = frame
            .output
            .bars
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.length.total_cmp(&b.1.length))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(longest, 16);
    }

    #[test]
    fn test_bar_tip() {
        let bar = Bar {
            angle: 0.0,
            radius: 10.0,
            length: 5.0,
            magnitude: 128,
        };
        assert_eq!(bar.tip((20.0, 20.0)), (35.0, 20.0));
    }

    #[test]
    fn test_terminal_renderer_draws_grid() {
        let (mut v, input, _) = visualizer(40, 20);
        input.push_slice(&tone(4.0));
        let frame = v.draw_frame();

        let mut out = Vec::new();
        {
            let mut renderer = TerminalRenderer::new(&mut out);
            renderer.render(&frame).unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("\x1b[H"));

        let lines: Vec<&str> = text.trim_start_matches("\x1b[H").lines().collect();
        assert_eq!(lines.len(), 21);
        assert!(lines[..20].iter().all(|l| l.chars().count() == 40));
        assert!(text.contains('.'));
        assert!(lines[20].starts_with("mic"));
    }

    #[test]
    fn test_viewport_parsing() {
        assert_eq!("80x40".parse::<Viewport>(), Ok(Viewport { width: 80, height: 40 }));
        assert_eq!(" 120 X 30 ".parse::<Viewport>(), Ok(Viewport { width: 120, height: 30 }));
        assert!("80".parse::<Viewport>().is_err());
        assert!("0x10".parse::<Viewport>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_draw_loop_stops_when_viewport_sender_drops() {
        let (v, _, _) = visualizer(32, 16);
        let (tx, rx) = watch::channel(Viewport { width: 32, height: 16 });
        tx.send(Viewport { width: 48, height: 24 }).unwrap();
        drop(tx);

        // Returns instead of looping forever
        run(v, Box::new(LogRenderer), 30, rx).await;
    }
}
