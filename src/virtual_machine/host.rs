//! Host side of the `INT` instruction.
//!
//! The interpreter handles `EXIT` itself and forwards printing to
//! [`Host::print_int`] / [`Host::print_char`]. Every other service goes to
//! [`Host::service`], which receives the whole [`Machine`] so it can read
//! registers and move bytes in and out of memory.

use crate::virtual_machine::errors::Fault;
use crate::virtual_machine::isa::{Register, Service};
use crate::virtual_machine::vm::Machine;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Why the machine stopped without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// The program invoked the `EXIT` service.
    Exit,
    /// The host asked to stop, e.g. its window was closed.
    HostRequest,
    /// A [`StopHandle`](crate::virtual_machine::vm::StopHandle) was triggered.
    Stopped,
}

/// Outcome of one executed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt(Halt),
}

/// Services a program can reach through `INT`.
pub trait Host {
    /// `PRINT_INT`: write `value` as signed decimal.
    fn print_int(&mut self, value: i32) -> Result<(), Fault>;

    /// `PRINT_CHAR`: write one byte.
    fn print_char(&mut self, byte: u8) -> Result<(), Fault>;

    /// Any service other than `EXIT`, `PRINT_INT` and `PRINT_CHAR`.
    fn service(&mut self, service: Service, machine: &mut Machine) -> Result<Flow, Fault> {
        let _ = machine;
        Err(Fault::ServiceUnavailable {
            service: service.name(),
        })
    }
}

/// Console host writing program output to `out`, with an optional block
/// device backing `READ_DISK`.
///
/// `POLL` never requests a stop; graphics services are unavailable.
pub struct StdHost<W, D = File> {
    out: W,
    drive: Option<D>,
}

impl<W: Write> StdHost<W> {
    pub fn new(out: W) -> Self {
        Self { out, drive: None }
    }
}

impl<W: Write, D: Read + Seek> StdHost<W, D> {
    pub fn with_drive(out: W, drive: D) -> Self {
        Self {
            out,
            drive: Some(drive),
        }
    }

    /// Consumes the host, returning the output sink.
    pub fn into_output(self) -> W {
        self.out
    }

    fn write_out(&mut self, service: Service, bytes: &[u8]) -> Result<(), Fault> {
        self.out
            .write_all(bytes)
            .and_then(|()| self.out.flush())
            .map_err(|e| Fault::ServiceFailed {
                service: service.name(),
                reason: e.to_string(),
            })
    }

    /// Copies drive bytes `[EAX, EBX)` to the top of the stack and advances
    /// ESP past them.
    fn read_disk(&mut self, machine: &mut Machine) -> Result<Flow, Fault> {
        let service = Service::ReadDisk.name();
        let drive = self
            .drive
            .as_mut()
            .ok_or(Fault::ServiceUnavailable { service })?;

        let start = machine.registers.get_signed(Register::Eax);
        let end = machine.registers.get_signed(Register::Ebx);
        if start < 0 || end <= start {
            return Err(Fault::ServiceFailed {
                service,
                reason: format!("invalid drive range [{start}, {end})"),
            });
        }
        let len = (end - start) as usize;

        let sp = machine.registers.get(Register::Esp);
        let capacity = machine.memory.len();
        let dst = machine
            .memory
            .slice_mut(sp, len)
            .map_err(|_| Fault::StackOverflow {
                pointer: sp,
                size: len,
                capacity,
            })?;

        let failed = |e: std::io::Error| Fault::ServiceFailed {
            service,
            reason: e.to_string(),
        };
        drive
            .seek(SeekFrom::Start(start as u64))
            .map_err(failed)?;
        drive.read_exact(dst).map_err(failed)?;

        machine.registers.set(Register::Esp, sp + len as u32);
        Ok(Flow::Continue)
    }
}

impl<W: Write, D: Read + Seek> Host for StdHost<W, D> {
    fn print_int(&mut self, value: i32) -> Result<(), Fault> {
        self.write_out(Service::PrintInt, value.to_string().as_bytes())
    }

    fn print_char(&mut self, byte: u8) -> Result<(), Fault> {
        self.write_out(Service::PrintChar, &[byte])
    }

    fn service(&mut self, service: Service, machine: &mut Machine) -> Result<Flow, Fault> {
        match service {
            Service::ReadDisk => self.read_disk(machine),
            Service::Poll => Ok(Flow::Continue),
            _ => Err(Fault::ServiceUnavailable {
                service: service.name(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::vm::Machine;
    use std::io::Cursor;

    fn machine() -> Machine {
        let mut machine = Machine::new(32).unwrap();
        machine.registers.set(Register::Esb, 8);
        machine.registers.set(Register::Esp, 8);
        machine
    }

    #[test]
    fn prints_to_output() {
        let mut host = StdHost::new(Vec::new());
        host.print_int(-42).unwrap();
        host.print_char(b'!').unwrap();
        assert_eq!(host.into_output(), b"-42!");
    }

    #[test]
    fn read_disk_pushes_bytes() {
        let mut host = StdHost::with_drive(Vec::new(), Cursor::new(b"abcdefgh".to_vec()));
        let mut m = machine();
        m.registers.set(Register::Eax, 2);
        m.registers.set(Register::Ebx, 5);

        assert_eq!(host.service(Service::ReadDisk, &mut m), Ok(Flow::Continue));
        assert_eq!(m.memory.slice(8, 3).unwrap(), b"cde");
        assert_eq!(m.registers.get(Register::Esp), 11);
    }

    #[test]
    fn read_disk_rejects_bad_ranges() {
        let mut host = StdHost::with_drive(Vec::new(), Cursor::new(vec![0u8; 64]));
        let mut m = machine();
        m.registers.set(Register::Eax, 5);
        m.registers.set(Register::Ebx, 5);
        assert!(matches!(
            host.service(Service::ReadDisk, &mut m),
            Err(Fault::ServiceFailed { .. })
        ));

        m.registers.set(Register::Eax, 0);
        m.registers.set(Register::Ebx, 40);
        assert!(matches!(
            host.service(Service::ReadDisk, &mut m),
            Err(Fault::StackOverflow { size: 40, .. })
        ));
        assert_eq!(m.registers.get(Register::Esp), 8);
    }

    #[test]
    fn read_disk_past_end_of_drive_fails() {
        let mut host = StdHost::with_drive(Vec::new(), Cursor::new(vec![1u8; 4]));
        let mut m = machine();
        m.registers.set(Register::Ebx, 8);
        assert!(matches!(
            host.service(Service::ReadDisk, &mut m),
            Err(Fault::ServiceFailed { service: "READ_DISK", .. })
        ));
    }

    #[test]
    fn missing_services_are_reported() {
        let mut host = StdHost::new(Vec::new());
        let mut m = machine();
        assert_eq!(
            host.service(Service::ReadDisk, &mut m),
            Err(Fault::ServiceUnavailable {
                service: "READ_DISK"
            })
        );
        assert_eq!(host.service(Service::Poll, &mut m), Ok(Flow::Continue));
        assert_eq!(
            host.service(Service::Draw, &mut m),
            Err(Fault::ServiceUnavailable { service: "DRAW" })
        );
    }
}
