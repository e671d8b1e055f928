//! ip2region xdb 文件查询
//!
//! 整个文件一次性读入内存，查询只读，可在多个任务间共享。
//! 布局：256 字节头部，之后是 256×256 的向量索引（每格 8 字节：段索引起止指针），
//! 段索引每条 14 字节：起始 IP、结束 IP（u32 LE）、数据长度（u16 LE）、数据指针（u32 LE）。

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::Context;

use super::Ipv4Lookup;

const HEADER_LEN: usize = 256;
const VECTOR_COLS: usize = 256;
const VECTOR_CELL_LEN: usize = 8;
const SEGMENT_LEN: usize = 14;
const VECTOR_LEN: usize = VECTOR_COLS * VECTOR_COLS * VECTOR_CELL_LEN;

pub struct XdbSearcher {
    content: Vec<u8>,
}

impl XdbSearcher {
    pub fn from_bytes(content: Vec<u8>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            content.len() >= HEADER_LEN + VECTOR_LEN,
            "xdb 文件过短: {} 字节",
            content.len()
        );
        Ok(Self { content })
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read(path).with_context(|| format!("读取 xdb 文件失败: {}", path.display()))?;
        let searcher = Self::from_bytes(content)?;
        tracing::info!(
            path = %path.display(),
            size = searcher.content.len(),
            "已加载 IPv4 归属库"
        );
        Ok(searcher)
    }

    fn u32_at(&self, offset: usize) -> Option<u32> {
        let bytes = self.content.get(offset..offset + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    fn u16_at(&self, offset: usize) -> Option<u16> {
        let bytes = self.content.get(offset..offset + 2)?;
        Some(u16::from_le_bytes(bytes.try_into().ok()?))
    }

    fn lookup(&self, ip: u32) -> Option<String> {
        let il0 = ((ip >> 24) & 0xFF) as usize;
        let il1 = ((ip >> 16) & 0xFF) as usize;
        let cell = HEADER_LEN + il0 * VECTOR_COLS * VECTOR_CELL_LEN + il1 * VECTOR_CELL_LEN;
        let start_ptr = self.u32_at(cell)? as usize;
        let end_ptr = self.u32_at(cell + 4)? as usize;
        if start_ptr == 0 || end_ptr < start_ptr {
            return None;
        }

        let mut low = 0usize;
        let mut high = (end_ptr - start_ptr) / SEGMENT_LEN;
        while low <= high {
            let mid = (low + high) / 2;
            let p = start_ptr + mid * SEGMENT_LEN;
            let start_ip = self.u32_at(p)?;
            if ip < start_ip {
                if mid == 0 {
                    return None;
                }
                high = mid - 1;
                continue;
            }
            let end_ip = self.u32_at(p + 4)?;
            if ip > end_ip {
                low = mid + 1;
                continue;
            }

            let len = self.u16_at(p + 8)? as usize;
            let ptr = self.u32_at(p + 10)? as usize;
            let data = self.content.get(ptr..ptr + len)?;
            return Some(String::from_utf8_lossy(data).into_owned());
        }
        None
    }
}

impl Ipv4Lookup for XdbSearcher {
    fn search(&self, ip: Ipv4Addr) -> Option<String> {
        self.lookup(u32::from(ip))
    }
}
