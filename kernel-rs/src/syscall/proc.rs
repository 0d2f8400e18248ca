//! Process syscalls.

use alloc::sync::Arc;

use crate::kernel::Kernel;
use crate::param::MAXCMDLINE;
use crate::proc::KernelCtx;
use crate::syscall::SysResult;
use crate::x86::TrapFrame;

impl Kernel {
    pub(crate) fn sys_exec(
        self: &Arc<Self>,
        ctx: &mut KernelCtx<'_>,
        frame: &TrapFrame,
    ) -> SysResult {
        let mut buf = [0u8; MAXCMDLINE];
        let bytes = self.arg_str(ctx, frame, 0, &mut buf)?;
        let cmdline = match core::str::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => return Ok(-1i32 as u32),
        };
        Ok(self.exec(ctx.proc, cmdline) as u32)
    }
}
