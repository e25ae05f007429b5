//! Movie objects (`MovieObject.bdmv`, tag MOBJ)
//!
//! Each title object is a flat list of 12-byte HDMV commands executed by
//! [`crate::hdmv::HdmvVm`].

use crate::cursor::{read_bd_header, BdHeader, ByteCursor, FormatError, FormatResult};
use serde::Serialize;

pub const MOBJ_TAG: &str = "MOBJ";
const DATA_OFFSET: usize = 40;
const COMMAND_SIZE: usize = 12;

#[derive(Debug, Clone, Serialize)]
pub struct MovieObject {
    pub header: BdHeader,
    pub objects: Vec<TitleObject>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TitleObject {
    pub resume_intention: bool,
    pub menu_call_mask: bool,
    pub title_search_mask: bool,
    pub commands: Vec<Command>,
}

/// The 4-byte instruction word of a command, unpacked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommandInsn {
    /// operand count, 3 bits
    pub op_cnt: u8,
    /// 2 bits
    pub grp: u8,
    /// 3 bits
    pub sub_grp: u8,
    pub imm_op1: bool,
    pub imm_op2: bool,
    /// 4 bits
    pub branch_opt: u8,
    /// 4 bits
    pub cmp_opt: u8,
    /// 5 bits
    pub set_opt: u8,
}

impl CommandInsn {
    pub fn from_bytes(b: [u8; 4]) -> Self {
        Self {
            op_cnt: b[0] >> 5,
            grp: (b[0] >> 3) & 0x03,
            sub_grp: b[0] & 0x07,
            imm_op1: b[1] & 0x80 != 0,
            imm_op2: b[1] & 0x40 != 0,
            branch_opt: b[1] & 0x0f,
            cmp_opt: b[2] & 0x0f,
            set_opt: b[3] & 0x1f,
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.op_cnt & 0x07) << 5 | (self.grp & 0x03) << 3 | (self.sub_grp & 0x07),
            (self.imm_op1 as u8) << 7 | (self.imm_op2 as u8) << 6 | (self.branch_opt & 0x0f),
            self.cmp_opt & 0x0f,
            self.set_opt & 0x1f,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Command {
    pub insn: CommandInsn,
    pub dst: u32,
    pub src: u32,
}

impl Command {
    pub fn to_bytes(&self) -> [u8; COMMAND_SIZE] {
        let mut out = [0u8; COMMAND_SIZE];
        out[..4].copy_from_slice(&self.insn.to_bytes());
        out[4..8].copy_from_slice(&self.dst.to_be_bytes());
        out[8..].copy_from_slice(&self.src.to_be_bytes());
        out
    }
}

impl MovieObject {
    pub fn command_count(&self) -> usize {
        self.objects.iter().map(|o| o.commands.len()).sum()
    }
}

pub fn parse_movie_object(data: &[u8]) -> FormatResult<MovieObject> {
    let mut cur = ByteCursor::new(data);
    let header = read_bd_header(&mut cur, MOBJ_TAG)?;
    let _extension_start = cur.read_offset()?;

    cur.seek(DATA_OFFSET)?;
    let data_len = cur.read_u32()? as usize;
    let available = data.len().saturating_sub(DATA_OFFSET + 4);
    if data_len > available {
        return Err(FormatError::LengthMismatch {
            offset: DATA_OFFSET,
            declared: data_len,
            available,
        });
    }

    cur.skip(4)?;
    let num_objects = cur.read_u16()?;

    let mut objects = Vec::with_capacity(num_objects as usize);
    for _ in 0..num_objects {
        let flags = cur.read_u8()?;
        cur.skip(1)?;
        let num_cmds = cur.read_u16()? as usize;
        cur.check_span(num_cmds * COMMAND_SIZE)?;

        let mut commands = Vec::with_capacity(num_cmds);
        for _ in 0..num_cmds {
            let word = cur.read_bytes(4)?;
            let insn = CommandInsn::from_bytes([word[0], word[1], word[2], word[3]]);
            commands.push(Command {
                insn,
                dst: cur.read_u32()?,
                src: cur.read_u32()?,
            });
        }

        objects.push(TitleObject {
            resume_intention: flags & 0x80 != 0,
            menu_call_mask: flags & 0x40 != 0,
            title_search_mask: flags & 0x20 != 0,
            commands,
        });
    }

    Ok(MovieObject { header, objects })
}
