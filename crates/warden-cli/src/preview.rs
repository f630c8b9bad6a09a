//! ASCII terminal preview for `warden watch`.

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::style::{Print, Stylize};
use crossterm::terminal::{self, ClearType};
use crossterm::{cursor, execute, queue};
use image::RgbImage;
use std::io::{self, Stdout, Write};
use std::time::Duration;
use warden_core::{BoundingBox, CaptureError, FrameSink, LoopState};

const ASCII_RAMP: [char; 11] = [' ', '.', '·', ':', ';', '+', '=', 'x', 'X', '#', '@'];
const MAX_WIDTH: usize = 80;
const MAX_HEIGHT: usize = 30;
/// Rows kept free below the picture for the status and help lines.
const FOOTER_ROWS: usize = 3;

/// Downsamples frames to a character grid.
#[derive(Debug, Clone, Copy)]
pub struct AsciiRenderer {
    width: usize,
    height: usize,
}

impl AsciiRenderer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    /// Size to the current terminal, capped at 80×30.
    pub fn for_terminal() -> Self {
        let (cols, rows) = terminal::size()
            .map(|(w, h)| (w as usize, h as usize))
            .unwrap_or((MAX_WIDTH, MAX_HEIGHT + FOOTER_ROWS));
        Self::new(cols.min(MAX_WIDTH), rows.saturating_sub(FOOTER_ROWS).min(MAX_HEIGHT))
    }

    pub fn render(&self, frame: &RgbImage, face: Option<&BoundingBox>) -> Vec<String> {
        let mut grid = self.to_ascii(frame);
        if let Some(face) = face {
            self.draw_box(&mut grid, face, frame.width() as f32, frame.height() as f32);
        }
        grid.into_iter().map(|row| row.into_iter().collect()).collect()
    }

    fn to_ascii(&self, frame: &RgbImage) -> Vec<Vec<char>> {
        let mut grid = vec![vec![' '; self.width]; self.height];
        let (w, h) = frame.dimensions();
        if w == 0 || h == 0 {
            return grid;
        }

        for (ty, row) in grid.iter_mut().enumerate() {
            let y = (ty * h as usize / self.height) as u32;
            for (tx, cell) in row.iter_mut().enumerate() {
                let x = (tx * w as usize / self.width) as u32;
                let [r, g, b] = frame.get_pixel(x, y).0;
                let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000;
                *cell = ASCII_RAMP[luma as usize * (ASCII_RAMP.len() - 1) / 255];
            }
        }
        grid
    }

    fn draw_box(&self, grid: &mut [Vec<char>], face: &BoundingBox, img_w: f32, img_h: f32) {
        let col = |x: f32| ((x / img_w) * self.width as f32).clamp(0.0, (self.width - 1) as f32) as usize;
        let row = |y: f32| ((y / img_h) * self.height as f32).clamp(0.0, (self.height - 1) as f32) as usize;
        let (x1, x2) = (col(face.x), col(face.x + face.width));
        let (y1, y2) = (row(face.y), row(face.y + face.height));
        if x2 <= x1 || y2 <= y1 {
            return;
        }

        for x in x1 + 1..x2 {
            grid[y1][x] = '─';
            grid[y2][x] = '─';
        }
        for line in grid.iter_mut().take(y2).skip(y1 + 1) {
            line[x1] = '│';
            line[x2] = '│';
        }
        grid[y1][x1] = '┌';
        grid[y1][x2] = '┐';
        grid[y2][x1] = '└';
        grid[y2][x2] = '┘';
    }
}

/// Interactive sink: raw-mode terminal, redrawn every frame.
///
/// Esc, `q` or Ctrl-C stops the loop. The terminal is restored on drop.
pub struct TerminalSink {
    out: Stdout,
    renderer: AsciiRenderer,
}

impl TerminalSink {
    pub fn new() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        let mut out = io::stdout();
        execute!(out, cursor::Hide, terminal::Clear(ClearType::All))?;
        Ok(Self {
            out,
            renderer: AsciiRenderer::for_terminal(),
        })
    }

    fn draw(&mut self, frame: &RgbImage, face: Option<&BoundingBox>, state: &LoopState) -> io::Result<()> {
        let lines = self.renderer.render(frame, face);
        queue!(self.out, cursor::MoveTo(0, 0))?;
        for line in &lines {
            queue!(self.out, Print(line), terminal::Clear(ClearType::UntilNewLine), Print("\r\n"))?;
        }

        let status = state.to_string();
        let styled = match state {
            LoopState::Matched { .. } => status.green().bold(),
            LoopState::Alerting { .. } => status.red().bold(),
            _ => status.dark_grey(),
        };
        queue!(
            self.out,
            Print(styled),
            terminal::Clear(ClearType::UntilNewLine),
            Print("\r\n"),
            Print("Esc / q to stop".dark_grey()),
            terminal::Clear(ClearType::FromCursorDown)
        )?;
        self.out.flush()
    }
}

impl FrameSink for TerminalSink {
    fn show(&mut self, frame: &RgbImage, face: Option<&BoundingBox>, state: &LoopState) -> Result<(), CaptureError> {
        self.draw(frame, face, state)
            .map_err(|e| CaptureError::Display(e.to_string()))
    }

    fn stop_requested(&mut self) -> bool {
        loop {
            match event::poll(Duration::ZERO) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    tracing::warn!(error = %e, "terminal input unavailable, stopping");
                    return true;
                }
            }
            match event::read() {
                Ok(Event::Key(key)) if is_stop_key(&key) => return true,
                Ok(_) => {}
                Err(_) => return true,
            }
        }
    }
}

impl Drop for TerminalSink {
    fn drop(&mut self) {
        let _ = execute!(self.out, cursor::Show, Print("\r\n"));
        let _ = terminal::disable_raw_mode();
    }
}

fn is_stop_key(key: &KeyEvent) -> bool {
    match key.code {
        KeyCode::Esc | KeyCode::Char('q') => true,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}
