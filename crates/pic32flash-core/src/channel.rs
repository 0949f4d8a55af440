//! Bit-level shift abstraction implemented by each JTAG-capable transport.

use crate::error::Result;

/// A channel able to clock TMS/TDI bit sequences into the target TAP.
///
/// The contract mirrors the wire behavior every transport must reproduce:
///
/// - `tms` is clocked first, LSB first, up to 14 bits, with TDI held low.
/// - When `tdi_nbits > 0`, the data field is bracketed by the fixed TMS
///   `1-0-0` prologue and `1-0` epilogue that move the TAP through
///   Shift-DR; the last TDI bit is clocked together with the first
///   epilogue TMS bit.
/// - With `read`, the TDO bits sampled during the data field are decoded
///   into a word, LSB first.
///
/// Implementations may buffer writes; a read or an explicit [`flush`]
/// forces the buffered bits onto the wire.
///
/// [`flush`]: BitChannel::flush
pub trait BitChannel {
    /// Clock a TMS prologue and an optional TDI field, optionally
    /// sampling TDO. Returns the decoded word when `read` is set.
    fn shift(
        &mut self,
        tms_nbits: u32,
        tms: u32,
        tdi_nbits: u32,
        tdi: u64,
        read: bool,
    ) -> Result<Option<u64>>;

    /// Push any buffered bits onto the wire.
    fn flush(&mut self) -> Result<()>;

    /// Insert a delay that is guaranteed to elapse at the target, after
    /// everything buffered so far has been clocked out.
    fn target_delay_ms(&mut self, ms: u32) -> Result<()>;

    /// Release the channel at end of session. `power_on` leaves target
    /// power up where the transport controls it.
    fn finish(&mut self, _power_on: bool) -> Result<()> {
        Ok(())
    }
}

/// Shorthand for a shift that must return data.
pub(crate) fn shift_read<C: BitChannel + ?Sized>(
    chan: &mut C,
    tms_nbits: u32,
    tms: u32,
    tdi_nbits: u32,
    tdi: u64,
) -> Result<u64> {
    let word = chan.shift(tms_nbits, tms, tdi_nbits, tdi, true)?;
    word.ok_or_else(|| {
        crate::Error::Protocol("channel returned no data for a read shift".into())
    })
}
