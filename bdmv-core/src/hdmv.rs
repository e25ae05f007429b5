//! HDMV navigation virtual machine
//!
//! Executes movie object commands against a [`RegisterFile`] until a
//! playlist has to be played, the current object runs out of commands,
//! or the caller's step budget is spent.

pub mod insn;

use crate::index::{IndexObject, IndexRoot};
use crate::mobj::{Command, MovieObject};
use crate::navigation::NavigationError;
use crate::registers::{Psr, RegisterFile};
use insn::{Instruction, OperandMode, SetOp};
use serde::{Deserialize, Serialize};

/// A playback hand-off produced by a PLAY command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayRequest {
    pub playlist: u32,
    pub play_item: Option<u32>,
    pub mark: Option<u32>,
}

impl PlayRequest {
    pub fn playlist(playlist: u32) -> Self {
        Self {
            playlist,
            play_item: None,
            mark: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Play(PlayRequest),
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmOutcome {
    Play(PlayRequest),
    /// The current object or command index left its array
    Halted,
    /// The step budget ran out
    Yielded,
}

/// What happens to the command index after a command ran.
enum Flow {
    Next,
    /// Comparison was false
    SkipNext,
    /// Object or command index was set explicitly
    Stay,
}

pub struct HdmvVm {
    movie: MovieObject,
    index: Option<IndexRoot>,
    regs: RegisterFile,
    object: usize,
    cmd: usize,
}

impl HdmvVm {
    pub fn new(movie: MovieObject, index: Option<IndexRoot>, regs: RegisterFile) -> Self {
        Self {
            movie,
            index,
            regs,
            object: 0,
            cmd: 0,
        }
    }

    pub fn object_index(&self) -> usize {
        self.object
    }

    pub fn command_index(&self) -> usize {
        self.cmd
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    pub fn index(&self) -> Option<&IndexRoot> {
        self.index.as_ref()
    }

    /// Positions the VM on the first-play object, or object 0 when the disc
    /// has no HDMV first-play entry.
    pub fn start_first_play(&mut self) -> Result<(), NavigationError> {
        if self.movie.objects.is_empty() {
            return Err(NavigationError::NoMovieObjects);
        }
        let first = self.index.as_ref().and_then(|i| i.first_play.as_ref());
        self.object = match first {
            Some(IndexObject::Hdmv { id_ref, .. }) => *id_ref as usize,
            Some(IndexObject::Bdj { name, .. }) => {
                tracing::warn!(name = %name, "BD-J first play unsupported, starting at object 0");
                0
            }
            None => 0,
        };
        self.cmd = 0;
        tracing::debug!(object = self.object, "first play");
        Ok(())
    }

    /// Switches to the movie object of title `number` (1-based).
    pub fn jump_title(&mut self, number: u32) -> Result<(), NavigationError> {
        let title = self
            .index
            .as_ref()
            .and_then(|i| i.title(number))
            .ok_or(NavigationError::TitleOutOfRange(number))?;
        match &title.object {
            IndexObject::Hdmv { id_ref, .. } => {
                let id_ref = *id_ref as usize;
                self.object = id_ref;
                self.cmd = 0;
                self.regs.write_psr(Psr::Title, number);
                tracing::debug!(title = number, object = id_ref, "jump title");
                Ok(())
            }
            IndexObject::Bdj { name, .. } => Err(NavigationError::UnsupportedTitle {
                title: number,
                name: name.clone(),
            }),
        }
    }

    pub fn jump_object(&mut self, object: u32) -> Result<(), NavigationError> {
        if object as usize >= self.movie.objects.len() {
            return Err(NavigationError::ObjectOutOfRange(object));
        }
        self.object = object as usize;
        self.cmd = 0;
        Ok(())
    }

    fn current(&self) -> Option<Command> {
        self.movie
            .objects
            .get(self.object)?
            .commands
            .get(self.cmd)
            .copied()
    }

    /// Runs at most `limit` commands.
    pub fn run(&mut self, limit: usize) -> Result<VmOutcome, NavigationError> {
        for _ in 0..limit {
            match self.step()? {
                StepOutcome::Continue => {}
                StepOutcome::Play(req) => return Ok(VmOutcome::Play(req)),
                StepOutcome::Halted => return Ok(VmOutcome::Halted),
            }
        }
        tracing::debug!(limit, object = self.object, cmd = self.cmd, "VM yielded");
        Ok(VmOutcome::Yielded)
    }

    /// Executes one command.
    pub fn step(&mut self) -> Result<StepOutcome, NavigationError> {
        let Some(cmd) = self.current() else {
            return Ok(StepOutcome::Halted);
        };
        let insn = Instruction::decode(&cmd.insn);
        let mode = insn.operand_mode();

        let dst = if cmd.insn.op_cnt > 0 {
            self.fetch_operand(mode, cmd.insn.imm_op1, cmd.dst)
        } else {
            0
        };
        let src = if cmd.insn.op_cnt > 1 {
            self.fetch_operand(mode, cmd.insn.imm_op2, cmd.src)
        } else {
            0
        };

        let mut play = None;
        let flow = match insn {
            Instruction::Nop => Flow::Next,
            Instruction::Goto => {
                self.cmd = (dst as usize).wrapping_sub(1);
                Flow::Next
            }
            Instruction::Break => {
                tracing::debug!(object = self.object, "break");
                self.cmd = usize::MAX;
                return Ok(StepOutcome::Halted);
            }
            Instruction::JumpObject => match self.jump_object(dst) {
                Ok(()) => Flow::Stay,
                Err(e) => {
                    tracing::warn!(error = %e, "jump object ignored");
                    Flow::Next
                }
            },
            Instruction::JumpTitle => match self.jump_title(dst) {
                Ok(()) => Flow::Stay,
                Err(e @ NavigationError::UnsupportedTitle { .. }) => {
                    self.cmd = usize::MAX;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "jump title ignored");
                    Flow::Next
                }
            },
            Instruction::PlayPl => {
                play = Some(self.play(dst, None, None));
                Flow::Next
            }
            Instruction::PlayPlPi => {
                play = Some(self.play(dst, Some(src), None));
                Flow::Next
            }
            Instruction::PlayPlPm => {
                play = Some(self.play(dst, None, Some(src)));
                Flow::Next
            }
            Instruction::Compare(op) => {
                if cmd.insn.op_cnt < 2 {
                    tracing::warn!(cmd = self.cmd, "missing operand in compare");
                }
                if op.eval(dst, src) {
                    Flow::Next
                } else {
                    Flow::SkipNext
                }
            }
            Instruction::Set(SetOp::Move) => {
                if cmd.insn.op_cnt < 2 {
                    tracing::warn!(cmd = self.cmd, "missing operand in move");
                }
                if let Err(e) = self.store(&cmd, dst, src) {
                    tracing::warn!(error = %e, object = self.object, cmd = self.cmd, "move rejected");
                }
                Flow::Next
            }
            Instruction::SetStream => {
                self.set_stream(dst, src);
                Flow::Next
            }
            Instruction::Unknown { grp, sub_grp, opt } => {
                tracing::warn!(grp, sub_grp, opt, "unknown HDMV instruction");
                Flow::Next
            }
            other => {
                tracing::warn!(insn = ?other, "unsupported HDMV instruction");
                Flow::Next
            }
        };

        match flow {
            Flow::Next => self.cmd = self.cmd.wrapping_add(1),
            Flow::SkipNext => self.cmd = self.cmd.wrapping_add(2),
            Flow::Stay => {}
        }

        Ok(match play {
            Some(req) => StepOutcome::Play(req),
            None => StepOutcome::Continue,
        })
    }

    fn fetch_operand(&self, mode: OperandMode, imm: bool, value: u32) -> u32 {
        if imm {
            return value;
        }
        match mode {
            OperandMode::Stream => {
                let flags = value & 0xf000_f000;
                let reg0 = (value & 0xfff) as usize;
                let reg1 = ((value >> 16) & 0xfff) as usize;
                flags | (self.regs.gpr(reg0) & 0x0fff) | ((self.regs.gpr(reg1) & 0x0fff) << 16)
            }
            OperandMode::ButtonPage => {
                let flags = value & 0xc000_0000;
                let reg0 = (value & 0xfff) as usize;
                flags | (self.regs.gpr(reg0) & 0x3fff_ffff)
            }
            OperandMode::Register => self.regs.read(value).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "operand read as 0");
                0
            }),
        }
    }

    /// Writes the MOVE result back when it changed the destination.
    fn store(&mut self, cmd: &Command, dst0: u32, src: u32) -> Result<(), NavigationError> {
        let dst = src;
        if dst == dst0 {
            return Ok(());
        }
        if cmd.insn.imm_op1 {
            return Err(NavigationError::StoreToImmediate);
        }
        self.regs.write_gpr(cmd.dst, dst)
    }

    fn set_stream(&mut self, dst: u32, src: u32) {
        if dst & 0x8000_0000 != 0 {
            self.regs.write_psr(Psr::PrimaryAudio, (dst >> 16) & 0xfff);
        }
        if src & 0x8000_0000 != 0 {
            self.regs.write_psr(Psr::IgStream, (src >> 16) & 0xff);
        }
        if src & 0x8000 != 0 {
            self.regs.write_psr(Psr::Angle, src & 0xff);
        }
        if dst & 0x8000 != 0 {
            // display flag from bit 14 lands in bit 31
            let pg = self.regs.psr(Psr::PgStream) & !0x8000_0fff;
            self.regs
                .write_psr(Psr::PgStream, pg | ((dst & 0x4000) << 17) | (dst & 0xfff));
        }
    }

    fn play(&mut self, playlist: u32, play_item: Option<u32>, mark: Option<u32>) -> PlayRequest {
        self.regs.write_psr(Psr::Playlist, playlist);
        if let Some(item) = play_item {
            self.regs.write_psr(Psr::PlayItem, item);
        }
        tracing::info!(playlist, ?play_item, ?mark, "play");
        PlayRequest {
            playlist,
            play_item,
            mark,
        }
    }
}
