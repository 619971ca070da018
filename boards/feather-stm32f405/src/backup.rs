//! Record store in the RTC backup registers
//!
//! The STM32F405 has 20 battery-backed 32-bit registers. Register 0 holds
//! a header (magic and length) and the record follows little-endian in the
//! remaining registers, so one small record fits.

use embassy_stm32::pac;
use hal_abstractions::{FileId, FileStore, StorageError};

const BACKUP_REGS: usize = 20;
const CAPACITY: usize = (BACKUP_REGS - 1) * 4;
const MAGIC: u32 = 0x7153_0000;
const MAGIC_MASK: u32 = 0xFFFF_0000;

fn read_reg(n: usize) -> u32 {
    pac::RTC.bkpr(n).read().bkp()
}

fn write_reg(n: usize, value: u32) {
    pac::RTC.bkpr(n).write(|w| w.set_bkp(value));
}

/// Backup-register store holding the time variables
pub struct BackupStore;

impl FileStore for BackupStore {
    fn read(&mut self, id: FileId, buf: &mut [u8]) -> Result<usize, StorageError> {
        if id != FileId::TIME_SYS {
            return Err(StorageError::NotFound);
        }
        let header = read_reg(0);
        if header & MAGIC_MASK != MAGIC {
            return Err(StorageError::NotFound);
        }
        let len = ((header & !MAGIC_MASK) as usize).min(CAPACITY);
        if len > buf.len() {
            return Err(StorageError::TooLarge);
        }
        for (i, chunk) in buf[..len].chunks_mut(4).enumerate() {
            let word = read_reg(i + 1).to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        Ok(len)
    }

    fn write(&mut self, id: FileId, data: &[u8]) -> Result<(), StorageError> {
        if id != FileId::TIME_SYS {
            return Err(StorageError::NotFound);
        }
        if data.len() > CAPACITY {
            return Err(StorageError::TooLarge);
        }
        // Header goes last; an interrupted write reads back as missing
        write_reg(0, 0);
        for (i, chunk) in data.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            write_reg(i + 1, u32::from_le_bytes(word));
        }
        write_reg(0, MAGIC | data.len() as u32);
        Ok(())
    }
}
