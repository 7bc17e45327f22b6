use crate::device::{DeviceError, Result, Session};
use crate::serial::frame::{Frame, MessageId, PayloadReader, PayloadWriter, MAX_PAYLOAD_LEN};
use crate::serial::queue::Request;
use super::types::*;

// name, address, length
const DATA_HEADER_LEN: usize = 1 + 4 + 2;

/// Split `[address, address + len)` at page boundaries.
///
/// Chunks are also capped so a data frame never exceeds the payload limit.
pub fn page_chunks(address: u32, len: usize, page_size: u16) -> Vec<(u32, usize)> {
    let page = page_size.max(1) as u64;
    let max_chunk = (MAX_PAYLOAD_LEN - DATA_HEADER_LEN) as u64;
    let end = address as u64 + len as u64;

    let mut chunks = Vec::new();
    let mut cursor = address as u64;
    while cursor < end {
        let page_end = (cursor / page + 1) * page;
        let chunk_end = page_end.min(end).min(cursor + max_chunk);
        chunks.push((cursor as u32, (chunk_end - cursor) as usize));
        cursor = chunk_end;
    }
    chunks
}

impl Session {
    /// Query storage geometry; the page size is kept for later transfers
    pub async fn efs_hardware_info(&self) -> Result<EfsHardwareInfo> {
        let request = Request::new(
            "efs_hardware_info",
            Frame::short(MessageId::EFS_REQ_HWINFO, 0, 0),
            MessageId::EFS_GET_HWINFO,
        );
        let reply = self.command(request).await?;
        let mut reader = PayloadReader::new(reply.payload());
        let info = EfsHardwareInfo {
            available: reader.u8()? != 0,
            version: reader.u8()?,
            page_size: reader.u16()?,
            pages_supported: reader.u16()?,
            maximum_files: reader.u16()?,
            files_remain: reader.u16()?,
            pages_remain: reader.u16()?,
        };
        *self.efs_info.lock().await = Some(info);
        Ok(info)
    }

    async fn efs_page_size(&self) -> Result<u16> {
        let cached = *self.efs_info.lock().await;
        let info = match cached {
            Some(info) => info,
            None => self.efs_hardware_info().await?,
        };
        if !info.available || info.page_size == 0 {
            return Err(DeviceError::DeviceFault("embedded file system unavailable".to_string()));
        }
        Ok(info.page_size)
    }

    /// File descriptor as reported, including files that do not exist
    async fn read_file_info(&self, name: u8) -> Result<EfsFileInfo> {
        let request = Request::new(
            "efs_file_info",
            Frame::short(MessageId::EFS_REQ_FILEINFO, name, 0),
            MessageId::EFS_GET_FILEINFO,
        );
        let reply = self.command(request).await?;
        let mut reader = PayloadReader::new(reply.payload());
        let reported = reader.u8()?;
        if reported != name {
            return Err(DeviceError::Transport(crate::serial::SerialError::ProtocolError(format!(
                "asked for file {}, controller described file {}",
                name, reported
            ))));
        }
        Ok(EfsFileInfo {
            name,
            exists: reader.u8()? != 0,
            owned: reader.u8()? != 0,
            attributes: FileAttributes::from_bits_retain(reader.u8()?),
            length_pages: reader.u16()?,
        })
    }

    pub async fn efs_file_info(&self, name: u8) -> Result<EfsFileInfo> {
        let info = self.read_file_info(name).await?;
        if !info.exists {
            return Err(DeviceError::FileNotFound(name));
        }
        Ok(info)
    }

    /// Create a file of `length_pages` pages, or delete it when `length_pages` is 0
    pub async fn efs_set_file_info(&self, name: u8, attributes: u8, length_pages: u16) -> Result<()> {
        let attributes = FileAttributes::from_wire(attributes)?;
        let current = self.read_file_info(name).await?;

        if length_pages == 0 {
            if !current.exists {
                return Err(DeviceError::FileNotFound(name));
            }
            if !current.attributes.allows(Access::Delete) {
                return Err(DeviceError::PermissionDenied(format!("file {} may not be deleted", name)));
            }
        } else {
            if current.exists {
                return Err(DeviceError::FileExists(name));
            }
            let storage = self.efs_hardware_info().await?;
            if storage.files_remain == 0 || length_pages > storage.pages_remain {
                return Err(DeviceError::OutOfRange(format!(
                    "{} pages requested, {} pages and {} files left",
                    length_pages, storage.pages_remain, storage.files_remain
                )));
            }
        }

        let payload = PayloadWriter::new()
            .put_u8(name)
            .put_u8(attributes.bits())
            .put_u16(length_pages)
            .finish();
        self.command(Request::acked("efs_set_file_info", Frame::long(MessageId::EFS_SET_FILEINFO, payload)))
            .await?;

        if length_pages == 0 {
            log::info!("Deleted EFS file {}", name);
        } else {
            log::info!("Created EFS file {} with {} pages ({:?})", name, length_pages, attributes);
        }
        Ok(())
    }

    pub async fn efs_read_data(&self, name: u8, address: u32, length: u16) -> Result<Vec<u8>> {
        let info = self.efs_file_info(name).await?;
        let page_size = self.efs_page_size().await?;
        info.check_access(Access::Read, address, length as usize, page_size)?;

        let mut data = Vec::with_capacity(length as usize);
        for (chunk_address, chunk_len) in page_chunks(address, length as usize, page_size) {
            let payload = PayloadWriter::new()
                .put_u8(name)
                .put_u32(chunk_address)
                .put_u16(chunk_len as u16)
                .finish();
            let request = Request::new(
                "efs_read_data",
                Frame::long(MessageId::EFS_REQ_FILEDATA, payload),
                MessageId::EFS_GET_FILEDATA,
            );
            let reply = self.command(request).await?;
            let mut reader = PayloadReader::new(reply.payload());
            let _name = reader.u8()?;
            let got_address = reader.u32()?;
            let got_len = reader.u16()? as usize;
            if got_address != chunk_address || got_len != chunk_len {
                return Err(DeviceError::Transport(crate::serial::SerialError::ProtocolError(format!(
                    "asked for {} bytes at {}, got {} at {}",
                    chunk_len, chunk_address, got_len, got_address
                ))));
            }
            data.extend_from_slice(reader.bytes(got_len)?);
        }
        Ok(data)
    }

    pub async fn efs_write_data(&self, name: u8, address: u32, data: &[u8]) -> Result<()> {
        if data.len() > u16::MAX as usize {
            return Err(DeviceError::OutOfRange(format!("{} bytes in one write", data.len())));
        }
        let info = self.efs_file_info(name).await?;
        let page_size = self.efs_page_size().await?;
        info.check_access(Access::Write, address, data.len(), page_size)?;

        let mut offset = 0;
        for (chunk_address, chunk_len) in page_chunks(address, data.len(), page_size) {
            let payload = PayloadWriter::new()
                .put_u8(name)
                .put_u32(chunk_address)
                .put_u16(chunk_len as u16)
                .put_bytes(&data[offset..offset + chunk_len])
                .finish();
            self.command(Request::acked("efs_write_data", Frame::long(MessageId::EFS_SET_FILEDATA, payload)))
                .await?;
            offset += chunk_len;
        }
        log::debug!("Wrote {} bytes to EFS file {} at {}", data.len(), name, address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_split_at_page_boundaries() {
        assert_eq!(page_chunks(0, 256, 256), vec![(0, 256)]);
        assert_eq!(page_chunks(200, 100, 256), vec![(200, 56), (256, 44)]);
        assert_eq!(page_chunks(10, 600, 256), vec![(10, 246), (256, 256), (512, 98)]);
        assert!(page_chunks(5, 0, 256).is_empty());
    }

    #[test]
    fn test_chunks_respect_frame_limit() {
        let chunks = page_chunks(0, 4096, 4096);
        assert!(chunks.iter().all(|(_, len)| *len <= MAX_PAYLOAD_LEN - DATA_HEADER_LEN));
        assert_eq!(chunks.iter().map(|(_, len)| len).sum::<usize>(), 4096);
    }
}
