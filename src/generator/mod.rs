//! Compiles an image's raw CFI into a [`QutSections`] table.
//!
//! Sources are tried in priority order and the first one that yields entries
//! wins. Per-entry failures are counted and skipped, a source that can't be
//! read or parsed at all is abandoned in favour of the next one.

mod dwarf;
mod exidx;

use crate::arch::Arch;
use crate::error::QutErrorCode;
use crate::frame_info::{CfiSource, FrameInfos};
use crate::memory::Memory;
use crate::quicken::{AddressWidth, QutSections, TableBuilder};
use log::{debug, warn};
use std::sync::Arc;

use self::dwarf::{DwarfDecoder, EhFrameHdrDecoder};
use self::exidx::ExidxDecoder;

pub use self::exidx::{decode_ehabi, EhabiOp};

/// Everything a decoder may look at.
pub(crate) struct DecodeContext<'a> {
    pub arch: Arch,
    pub infos: &'a FrameInfos,
    /// Image bytes, addressed by file offset.
    pub memory: &'a dyn Memory,
}

/// One way of turning a raw CFI source into quicken entries.
pub(crate) trait CfiDecoder {
    fn source(&self) -> CfiSource;

    /// Feeds entries to `builder`. An `Err` means the section as a whole is
    /// unusable.
    fn decode(&self, ctx: &DecodeContext<'_>, builder: &mut TableBuilder)
        -> Result<(), QutErrorCode>;
}

fn decoder_for<W: AddressWidth>(source: CfiSource) -> Box<dyn CfiDecoder> {
    match source {
        CfiSource::ArmExidx => Box::new(ExidxDecoder),
        CfiSource::EhFrameHdr => {
            Box::new(EhFrameHdrDecoder::<W>::new(CfiSource::EhFrameHdr, CfiSource::EhFrame))
        }
        CfiSource::GnuEhFrameHdr => Box::new(EhFrameHdrDecoder::<W>::new(
            CfiSource::GnuEhFrameHdr,
            CfiSource::GnuEhFrame,
        )),
        CfiSource::EhFrame | CfiSource::GnuEhFrame => Box::new(DwarfDecoder::<W>::eh_frame(source)),
        CfiSource::DebugFrame | CfiSource::GnuDebugFrame => {
            Box::new(DwarfDecoder::<W>::debug_frame(source))
        }
    }
}

/// Whether every section `source` needs is present.
fn available(source: CfiSource, infos: &FrameInfos) -> bool {
    let needs = |s| infos.get(s).is_present();
    match source {
        CfiSource::EhFrameHdr => needs(CfiSource::EhFrameHdr) && needs(CfiSource::EhFrame),
        CfiSource::GnuEhFrameHdr => needs(CfiSource::GnuEhFrameHdr) && needs(CfiSource::GnuEhFrame),
        _ => needs(source),
    }
}

/// Result of one generation pass.
#[derive(Debug)]
pub(crate) struct Generated {
    pub sections: Option<Arc<QutSections>>,
    pub source: Option<CfiSource>,
    pub bad_entries: usize,
    pub last_error: QutErrorCode,
}

pub(crate) fn generate<W: AddressWidth>(
    ctx: &DecodeContext<'_>,
    priority: &[CfiSource],
) -> Generated {
    let mut bad_entries = 0;
    let mut last_error = QutErrorCode::None;

    for &source in priority {
        if !available(source, ctx.infos) {
            continue;
        }
        if source == CfiSource::ArmExidx && ctx.arch != Arch::Arm {
            warn!("ignoring exidx on {:?}", ctx.arch);
            last_error = QutErrorCode::ArchMismatch;
            continue;
        }

        let decoder = decoder_for::<W>(source);
        let mut builder = TableBuilder::new();
        let result = decoder.decode(ctx, &mut builder);
        let (sections, bad, code) = builder.build();
        bad_entries += bad;
        if bad > 0 {
            last_error = code;
        }

        match result {
            Err(code) => {
                warn!("{:?} unusable: {}", decoder.source(), code);
                last_error = code;
            }
            Ok(()) if sections.is_empty() => {
                debug!("{:?} produced no entries", decoder.source());
            }
            Ok(()) => {
                debug!(
                    "{:?}: {} entries, {} bytes of bytecode, {} bad",
                    decoder.source(),
                    sections.len(),
                    sections.bytecode().len(),
                    bad_entries
                );
                return Generated {
                    sections: Some(Arc::new(sections)),
                    source: Some(source),
                    bad_entries,
                    last_error,
                };
            }
        }
    }

    if last_error.is_none() {
        last_error = QutErrorCode::NoUnwindInfo;
    }
    Generated {
        sections: None,
        source: None,
        bad_entries,
        last_error,
    }
}
