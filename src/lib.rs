//! XM module file parser and player.
//!
//! [XM] is the "Extended Module" format written by [FastTracker II].
//! An XM file carries the full song: the pattern order, the note/effect
//! patterns themselves, and the instruments with their sample waveforms
//! and envelopes.
//!
//! This library parses XM 1.04 files into an [XmContext] and renders them
//! to interleaved stereo `f32` audio frames. Rendering is a pure function
//! of the context state: the same module and sample rate produce
//! bit-identical output on every run and on every target.
//!
//! [XM]: https://en.wikipedia.org/wiki/XM_(file_format)
//! [FastTracker II]: https://en.wikipedia.org/wiki/FastTracker_2
use std::{fs, io, path::Path};

mod xm;

pub use xm::*;

/// Attempts to load an XM module file from the given file `path` and
/// prepares a playback context rendering at `rate` audio frames per second.
///
/// Returns an instance of `XmContext` on success.
pub fn load_file<P: AsRef<Path>>(path: P, rate: u16) -> io::Result<XmContext> {
    let data = fs::read(path.as_ref())?;
    XmContext::load(&data, rate).map_err(io::Error::from)
}
