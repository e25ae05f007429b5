//! Instruction decoding for HDMV commands.
//!
//! The instruction word selects a group (branch, compare, set), a subgroup
//! and one option field. Every documented triple maps to one variant.

use crate::mobj::CommandInsn;
use serde::Serialize;

pub const GROUP_BRANCH: u8 = 0;
pub const GROUP_CMP: u8 = 1;
pub const GROUP_SET: u8 = 2;

pub const BRANCH_GOTO: u8 = 0;
pub const BRANCH_JUMP: u8 = 1;
pub const BRANCH_PLAY: u8 = 2;

pub const SET_SET: u8 = 0;
pub const SET_SETSYSTEM: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CmpOp {
    /// Bit check: true when every bit of dst is also set in src
    Bc,
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

impl CmpOp {
    fn from_opt(opt: u8) -> Option<Self> {
        Some(match opt {
            0x01 => CmpOp::Bc,
            0x02 => CmpOp::Eq,
            0x03 => CmpOp::Ne,
            0x04 => CmpOp::Ge,
            0x05 => CmpOp::Gt,
            0x06 => CmpOp::Le,
            0x07 => CmpOp::Lt,
            _ => return None,
        })
    }

    pub fn eval(self, dst: u32, src: u32) -> bool {
        match self {
            CmpOp::Bc => dst & !src == 0,
            CmpOp::Eq => dst == src,
            CmpOp::Ne => dst != src,
            CmpOp::Ge => dst >= src,
            CmpOp::Gt => dst > src,
            CmpOp::Le => dst <= src,
            CmpOp::Lt => dst < src,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SetOp {
    Move,
    Swap,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Rnd,
    And,
    Or,
    Xor,
    BitSet,
    BitClr,
    Shl,
    Shr,
}

impl SetOp {
    fn from_opt(opt: u8) -> Option<Self> {
        Some(match opt {
            0x01 => SetOp::Move,
            0x02 => SetOp::Swap,
            0x03 => SetOp::Add,
            0x04 => SetOp::Sub,
            0x05 => SetOp::Mul,
            0x06 => SetOp::Div,
            0x07 => SetOp::Mod,
            0x08 => SetOp::Rnd,
            0x09 => SetOp::And,
            0x0a => SetOp::Or,
            0x0b => SetOp::Xor,
            0x0c => SetOp::BitSet,
            0x0d => SetOp::BitClr,
            0x0e => SetOp::Shl,
            0x0f => SetOp::Shr,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Instruction {
    // branch / goto
    Nop,
    Goto,
    Break,
    // branch / jump
    JumpObject,
    JumpTitle,
    CallObject,
    CallTitle,
    Resume,
    // branch / play
    PlayPl,
    PlayPlPi,
    PlayPlPm,
    TerminatePl,
    LinkPi,
    LinkMk,
    Compare(CmpOp),
    Set(SetOp),
    // set / setsystem
    SetStream,
    SetNvTimer,
    SetButtonPage,
    EnableButton,
    DisableButton,
    SetSecStream,
    PopupOff,
    StillOn,
    StillOff,
    SetOutputMode,
    SetStreamSs,
    SetSystem0x10,
    Unknown { grp: u8, sub_grp: u8, opt: u8 },
}

/// How non-immediate operands are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandMode {
    Register,
    /// Two 12-bit GPR references plus flag bits
    Stream,
    /// One 12-bit GPR reference plus two flag bits
    ButtonPage,
}

impl Instruction {
    pub fn decode(insn: &CommandInsn) -> Self {
        use Instruction::*;
        let unknown = |opt| Unknown {
            grp: insn.grp,
            sub_grp: insn.sub_grp,
            opt,
        };

        match (insn.grp, insn.sub_grp) {
            (GROUP_BRANCH, BRANCH_GOTO) => match insn.branch_opt {
                0x00 => Nop,
                0x01 => Goto,
                0x02 => Break,
                opt => unknown(opt),
            },
            (GROUP_BRANCH, BRANCH_JUMP) => match insn.branch_opt {
                0x00 => JumpObject,
                0x01 => JumpTitle,
                0x02 => CallObject,
                0x03 => CallTitle,
                0x04 => Resume,
                opt => unknown(opt),
            },
            (GROUP_BRANCH, BRANCH_PLAY) => match insn.branch_opt {
                0x00 => PlayPl,
                0x01 => PlayPlPi,
                0x02 => PlayPlPm,
                0x03 => TerminatePl,
                0x04 => LinkPi,
                0x05 => LinkMk,
                opt => unknown(opt),
            },
            (GROUP_CMP, _) => CmpOp::from_opt(insn.cmp_opt)
                .map(Compare)
                .unwrap_or_else(|| unknown(insn.cmp_opt)),
            (GROUP_SET, SET_SET) => SetOp::from_opt(insn.set_opt)
                .map(Set)
                .unwrap_or_else(|| unknown(insn.set_opt)),
            (GROUP_SET, SET_SETSYSTEM) => match insn.set_opt {
                0x01 => SetStream,
                0x02 => SetNvTimer,
                0x03 => SetButtonPage,
                0x04 => EnableButton,
                0x05 => DisableButton,
                0x06 => SetSecStream,
                0x07 => PopupOff,
                0x08 => StillOn,
                0x09 => StillOff,
                0x0a => SetOutputMode,
                0x0b => SetStreamSs,
                0x10 => SetSystem0x10,
                opt => unknown(opt),
            },
            _ => unknown(0),
        }
    }

    pub fn operand_mode(&self) -> OperandMode {
        match self {
            Instruction::SetStream | Instruction::SetSecStream => OperandMode::Stream,
            Instruction::SetButtonPage => OperandMode::ButtonPage,
            _ => OperandMode::Register,
        }
    }

    /// The word that encodes this instruction with the given operand flags.
    pub fn encode(self, op_cnt: u8, imm_op1: bool, imm_op2: bool) -> CommandInsn {
        use Instruction::*;
        let mut insn = CommandInsn {
            op_cnt,
            imm_op1,
            imm_op2,
            ..CommandInsn::default()
        };
        let (grp, sub_grp) = match self {
            Nop | Goto | Break => (GROUP_BRANCH, BRANCH_GOTO),
            JumpObject | JumpTitle | CallObject | CallTitle | Resume => (GROUP_BRANCH, BRANCH_JUMP),
            PlayPl | PlayPlPi | PlayPlPm | TerminatePl | LinkPi | LinkMk => {
                (GROUP_BRANCH, BRANCH_PLAY)
            }
            Compare(_) => (GROUP_CMP, 0),
            Set(_) => (GROUP_SET, SET_SET),
            Unknown { grp, sub_grp, .. } => (grp, sub_grp),
            _ => (GROUP_SET, SET_SETSYSTEM),
        };
        insn.grp = grp;
        insn.sub_grp = sub_grp;

        match self {
            Nop | JumpObject | PlayPl => insn.branch_opt = 0x00,
            Goto | JumpTitle | PlayPlPi => insn.branch_opt = 0x01,
            Break | CallObject | PlayPlPm => insn.branch_opt = 0x02,
            CallTitle | TerminatePl => insn.branch_opt = 0x03,
            Resume | LinkPi => insn.branch_opt = 0x04,
            LinkMk => insn.branch_opt = 0x05,
            Compare(op) => insn.cmp_opt = op as u8 + 1,
            Set(op) => insn.set_opt = op as u8 + 1,
            SetStream => insn.set_opt = 0x01,
            SetNvTimer => insn.set_opt = 0x02,
            SetButtonPage => insn.set_opt = 0x03,
            EnableButton => insn.set_opt = 0x04,
            DisableButton => insn.set_opt = 0x05,
            SetSecStream => insn.set_opt = 0x06,
            PopupOff => insn.set_opt = 0x07,
            StillOn => insn.set_opt = 0x08,
            StillOff => insn.set_opt = 0x09,
            SetOutputMode => insn.set_opt = 0x0a,
            SetStreamSs => insn.set_opt = 0x0b,
            SetSystem0x10 => insn.set_opt = 0x10,
            Unknown { grp, opt, .. } => match grp {
                GROUP_BRANCH => insn.branch_opt = opt,
                GROUP_CMP => insn.cmp_opt = opt,
                _ => insn.set_opt = opt,
            },
        }
        insn
    }
}
