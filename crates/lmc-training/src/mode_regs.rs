//! DRAM mode-register encodings written through the MRW sequence.

use embedded_hal::delay::DelayNs;
use lmc_hal::{DramType, Lmc, LmcError, Rank, RegisterAccess};

use crate::error::TrainingError;
use crate::log::lmc_error;

/// Issue one mode-register write. A timed-out write is logged and
/// skipped; a value that does not fit `MR_MPR_CTL` is fatal.
pub fn write<B: RegisterAccess, D: DelayNs>(
    lmc: &mut Lmc<B, D>,
    rank: Rank,
    mr: u8,
    addr: u32,
) -> Result<(), TrainingError> {
    match lmc.mode_register_write(rank, mr, addr) {
        Ok(()) => Ok(()),
        Err(LmcError::Timeout(t)) => {
            lmc_error!("LMC{}: MR{} write to rank {}: {}", lmc.controller(), mr, rank.get(), t);
            Ok(())
        }
        Err(LmcError::Field(e)) => Err(e.into()),
    }
}

/// MR1: DLL enable, output drive and RTT_NOM.
pub const MR1: u8 = 1;
/// MR6: DDR4 VREF training.
pub const MR6: u8 = 6;

/// MR1 address bits.
#[allow(clippy::arithmetic_side_effects)] // shifts by constants below 32
pub fn mr1(dram: DramType, rtt_nom: u8, dic: u8) -> u32 {
    let nom = u32::from(rtt_nom & 0b111);
    let dic = u32::from(dic & 0b11);
    match dram {
        // A0 DLL enable, A2:A1 ODI, A10:A8 RTT_NOM
        DramType::Ddr4 => 1 | (dic << 1) | (nom << 8),
        // A0 = 0 keeps the DLL on; DIC on A5/A1, RTT_NOM on A9/A6/A2
        DramType::Ddr3 => {
            let dic_bits = ((dic & 1) << 1) | ((dic >> 1) << 5);
            let nom_bits = ((nom & 1) << 2) | (((nom >> 1) & 1) << 6) | ((nom >> 2) << 9);
            dic_bits | nom_bits
        }
    }
}

/// MR6 address bits: value on A5:A0, range on A6, training enable on A7.
#[allow(clippy::arithmetic_side_effects)]
pub fn mr6(range2: bool, value: u8, training: bool) -> u32 {
    u32::from(value & 0x3f) | (u32::from(range2) << 6) | (u32::from(training) << 7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddr4_mr1_places_rtt_nom_on_a10_a8() {
        assert_eq!(mr1(DramType::Ddr4, 3, 0), 0x301);
        assert_eq!(mr1(DramType::Ddr4, 0, 1), 0x003);
    }

    #[test]
    fn ddr3_mr1_scatters_rtt_nom() {
        // 0b101 -> A9 and A2
        assert_eq!(mr1(DramType::Ddr3, 0b101, 0), (1 << 9) | (1 << 2));
        assert_eq!(mr1(DramType::Ddr3, 0b010, 0b10), (1 << 6) | (1 << 5));
    }

    #[test]
    fn mr6_layout() {
        assert_eq!(mr6(true, 0x12, true), 0x12 | 0x40 | 0x80);
        assert_eq!(mr6(false, 0xff, false), 0x3f);
    }
}
