//! HDMV register file: 4096 general purpose and 128 player status registers.
//!
//! Register addresses in commands: PSRs have bit 31 set and the index in the
//! low 7 bits, GPRs use the low 12 bits. Any other pattern is invalid.

use crate::config::Region;
use crate::navigation::NavigationError;

pub const GPR_COUNT: usize = 4096;
pub const PSR_COUNT: usize = 128;
pub const PSR_FLAG: u32 = 0x8000_0000;

/// Named player status registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Psr {
    IgStream = 0,
    PrimaryAudio = 1,
    PgStream = 2,
    Angle = 3,
    Title = 4,
    Chapter = 5,
    Playlist = 6,
    PlayItem = 7,
    Time = 8,
    NavTimer = 9,
    SelectedButton = 10,
    MenuPage = 11,
    Style = 12,
    Parental = 13,
    SecondaryAudioVideo = 14,
    AudioCap = 15,
    AudioLang = 16,
    PgLang = 17,
    MenuLang = 18,
    Country = 19,
    Region = 20,
    OutputPrefer = 21,
    VideoCap = 29,
    TextCap = 30,
    ProfileVersion = 31,
}

// PSR15 bits
const AUDIO_CAP_LPCM_48_96_SURROUND: u32 = 0x0002;
const AUDIO_CAP_LPCM_192_SURROUND: u32 = 0x0008;
const AUDIO_CAP_DDPLUS_SURROUND: u32 = 0x0020;
const AUDIO_CAP_DDPLUS_DEP_SURROUND: u32 = 0x0080;
const AUDIO_CAP_DTSHD_CORE_SURROUND: u32 = 0x0200;
const AUDIO_CAP_DTSHD_EXT_SURROUND: u32 = 0x0800;
const AUDIO_CAP_DD_SURROUND: u32 = 0x2000;
const AUDIO_CAP_MLP_SURROUND: u32 = 0x8000;

// PSR29 bits
const VIDEO_CAP_SECONDARY_HD: u32 = 0x01;
const VIDEO_CAP_25HZ_50HZ: u32 = 0x02;

/// Profile 2, version 2.0
const PROFILE_2_V2_0: u32 = (0x03 << 16) | 0x0200;

const PSR_DEFAULTS: [u32; 62] = [
    1,          // 0: IG stream
    0xff,       // 1: primary audio stream
    0x0fff0fff, // 2: PG/TextST and PiP PG stream
    1,          // 3: angle
    0xffff,     // 4: title
    0xffff,     // 5: chapter
    0,          // 6: playlist
    0,          // 7: play item
    0,          // 8: presentation time
    0,          // 9: navigation timer
    0xffff,     // 10: selected button
    0,          // 11: page
    0xff,       // 12: user style
    0xff,       // 13: user age
    0xffff,     // 14: secondary audio/video stream
    AUDIO_CAP_LPCM_48_96_SURROUND
        | AUDIO_CAP_LPCM_192_SURROUND
        | AUDIO_CAP_DDPLUS_SURROUND
        | AUDIO_CAP_DDPLUS_DEP_SURROUND
        | AUDIO_CAP_DTSHD_CORE_SURROUND
        | AUDIO_CAP_DTSHD_EXT_SURROUND
        | AUDIO_CAP_DD_SURROUND
        | AUDIO_CAP_MLP_SURROUND,
    0xffffff, // 16: audio language
    0xffffff, // 17: PG/TextST language
    0xffffff, // 18: menu language
    0xffff,   // 19: country
    2,        // 20: region, overwritten from config
    0,        // 21: output mode preference (2D)
    0,
    0,
    0,
    0,
    0,
    0,
    0,
    VIDEO_CAP_SECONDARY_HD | VIDEO_CAP_25HZ_50HZ,
    0x1ffff, // 30: text subtitle capability
    PROFILE_2_V2_0,
    0,
    0,
    0,
    0,
    0xffff, // 36: backup PSR4
    0xffff, // 37: backup PSR5
    0,
    0,
    0,
    0,
    0xffff, // 42: backup PSR10
    0,
    0xff, // 44: backup PSR12
    0,
    0,
    0,
    // 48-61: characteristic text caps
    0xffffffff,
    0xffffffff,
    0xffffffff,
    0xffffffff,
    0xffffffff,
    0xffffffff,
    0xffffffff,
    0xffffffff,
    0xffffffff,
    0xffffffff,
    0xffffffff,
    0xffffffff,
    0xffffffff,
    0xffffffff,
];

/// A decoded register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterAddr {
    Gpr(usize),
    Psr(usize),
}

impl RegisterAddr {
    pub fn decode(addr: u32) -> Result<Self, NavigationError> {
        if addr & PSR_FLAG != 0 {
            if addr & !0x8000_007f != 0 {
                return Err(NavigationError::InvalidRegister(addr));
            }
            Ok(RegisterAddr::Psr((addr & 0x7f) as usize))
        } else {
            if addr & !0x0fff != 0 {
                return Err(NavigationError::InvalidRegister(addr));
            }
            Ok(RegisterAddr::Gpr(addr as usize))
        }
    }
}

pub struct RegisterFile {
    gpr: Box<[u32; GPR_COUNT]>,
    psr: [u32; PSR_COUNT],
}

impl RegisterFile {
    pub fn new(region: Region) -> Self {
        let mut psr = [0u32; PSR_COUNT];
        psr[..PSR_DEFAULTS.len()].copy_from_slice(&PSR_DEFAULTS);
        psr[Psr::Region as usize] = region.code();
        Self {
            gpr: Box::new([0u32; GPR_COUNT]),
            psr,
        }
    }

    /// Reads a register by its command encoding.
    pub fn read(&self, addr: u32) -> Result<u32, NavigationError> {
        Ok(match RegisterAddr::decode(addr)? {
            RegisterAddr::Gpr(i) => self.gpr[i],
            RegisterAddr::Psr(i) => self.psr[i],
        })
    }

    pub fn gpr(&self, index: usize) -> u32 {
        self.gpr[index & 0x0fff]
    }

    pub fn psr(&self, reg: Psr) -> u32 {
        self.psr[reg as usize]
    }

    pub fn psr_at(&self, index: usize) -> u32 {
        self.psr[index & 0x7f]
    }

    /// Writes a GPR by its command encoding. PSR addresses are rejected.
    pub fn write_gpr(&mut self, addr: u32, value: u32) -> Result<(), NavigationError> {
        match RegisterAddr::decode(addr)? {
            RegisterAddr::Gpr(i) => {
                self.gpr[i] = value;
                Ok(())
            }
            RegisterAddr::Psr(_) => Err(NavigationError::StoreToPsr(addr)),
        }
    }

    /// System commands only; movie object code can never reach this.
    pub(crate) fn write_psr(&mut self, reg: Psr, value: u32) {
        tracing::trace!(psr = reg as usize, value, "PSR write");
        self.psr[reg as usize] = value;
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new(Region::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_player_table() {
        let regs = RegisterFile::default();
        assert_eq!(regs.psr(Psr::IgStream), 1);
        assert_eq!(regs.psr(Psr::PrimaryAudio), 0xff);
        assert_eq!(regs.psr(Psr::PgStream), 0x0fff0fff);
        assert_eq!(regs.psr(Psr::Title), 0xffff);
        assert_eq!(regs.psr(Psr::AudioCap), 0xaaaa);
        assert_eq!(regs.psr(Psr::Region), 2);
        assert_eq!(regs.psr(Psr::VideoCap), 0x03);
        assert_eq!(regs.psr(Psr::ProfileVersion), 0x0003_0200);
        assert_eq!(regs.psr_at(61), 0xffffffff);
        assert_eq!(regs.psr_at(62), 0);
        assert_eq!(regs.gpr(0), 0);
    }

    #[test]
    fn region_comes_from_config() {
        let regs = RegisterFile::new(Region::C);
        assert_eq!(regs.psr(Psr::Region), 4);
    }

    #[test]
    fn address_validation() {
        assert_eq!(RegisterAddr::decode(0x0fff).unwrap(), RegisterAddr::Gpr(4095));
        assert_eq!(RegisterAddr::decode(0x8000_0014).unwrap(), RegisterAddr::Psr(20));
        assert_eq!(RegisterAddr::decode(0x1000), Err(NavigationError::InvalidRegister(0x1000)));
        assert_eq!(
            RegisterAddr::decode(0x8000_0080),
            Err(NavigationError::InvalidRegister(0x8000_0080))
        );
    }

    #[test]
    fn reads_and_writes() {
        let mut regs = RegisterFile::default();
        regs.write_gpr(7, 42).unwrap();
        assert_eq!(regs.read(7).unwrap(), 42);
        assert_eq!(regs.read(PSR_FLAG | 4).unwrap(), 0xffff);
        assert_eq!(regs.write_gpr(PSR_FLAG | 4, 1), Err(NavigationError::StoreToPsr(PSR_FLAG | 4)));
        regs.write_psr(Psr::Title, 3);
        assert_eq!(regs.psr(Psr::Title), 3);
    }
}
