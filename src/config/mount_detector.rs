// 挂载点检测模块
//
// 安装前需要确认不存在临时文件系统覆盖挂载（例如 /mnt/scratch），
// 否则更新后系统分区可能与覆盖层不一致。

use std::path::Path;

/// 挂载点信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// 挂载点路径
    pub path: String,
    /// 文件系统类型
    pub fs_type: String,
    /// 设备名称
    pub device: String,
}

/// 挂载点检测器
pub struct MountDetector;

impl MountDetector {
    /// 解析 /proc/mounts 格式的内容
    ///
    /// 每行格式: `<device> <mount point> <fs type> <options> <dump> <pass>`
    pub fn parse_mounts(content: &str) -> Vec<MountPoint> {
        content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let device = parts.next()?;
                let mount_point = parts.next()?;
                let fs_type = parts.next()?;
                Some(MountPoint {
                    path: unescape_mount_path(mount_point),
                    fs_type: fs_type.to_string(),
                    device: device.to_string(),
                })
            })
            .collect()
    }

    /// 获取当前所有挂载点
    pub fn get_mount_points() -> Vec<MountPoint> {
        #[cfg(target_os = "linux")]
        {
            match std::fs::read_to_string("/proc/mounts") {
                Ok(content) => Self::parse_mounts(&content),
                Err(e) => {
                    tracing::warn!("读取 /proc/mounts 失败: {}", e);
                    Vec::new()
                }
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            Vec::new()
        }
    }

    /// 检测路径是否是挂载点（精确匹配）
    pub fn is_exact_mount_point(path: &Path) -> bool {
        Self::is_mounted_in(&Self::get_mount_points(), path)
    }

    /// 在给定的挂载列表中检测路径
    pub fn is_mounted_in(mounts: &[MountPoint], path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        let wanted = path_str.trim_end_matches('/');
        mounts.iter().any(|mount| mount.path == wanted)
    }
}

/// /proc/mounts 中空格等字符以八进制转义（如 `\040`）
fn unescape_mount_path(raw: &str) -> String {
    if !raw.contains('\\') {
        return raw.to_string();
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + (b - b'0') as u32);
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
