//! # 进程与用户查询
//!
//! 这个模块负责与中继进程打交道：
//! 1. 通过 `/proc/<pid>/comm`（长名字再对照 `cmdline`）按名字查找进程
//! 2. 发送 SIGHUP 让中继重建链路
//! 3. 通过 `getpwnam_r` 把用户名解析为 uid
//! 4. 通过 `systemctl` 重启中继服务

use std::ffi::CString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

use crate::error::RedirectError;

/// `/proc/<pid>/comm` 的最大长度（内核 TASK_COMM_LEN 减去结尾的 NUL）
const COMM_MAX_LEN: usize = 15;

// ========================================
// 进程注册表接口
// ========================================

/// 主机进程表的抽象
pub trait ProcessRegistry {
    /// 按进程名查找 PID，找不到返回 None
    fn find_by_name(&self, name: &str) -> Option<i32>;

    /// 通知进程重新加载（SIGHUP）
    fn signal_reload(&self, pid: i32) -> Result<()>;
}

// ========================================
// /proc 实现
// ========================================

/// 基于 procfs 的进程注册表
pub struct ProcFsRegistry {
    /// procfs 挂载点，测试时可替换
    root: PathBuf,
    /// 为 true 时只记录日志，不真正发送信号
    dry_run: bool,
}

impl ProcFsRegistry {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc"),
            dry_run: false,
        }
    }

    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::new()
        }
    }

    #[cfg(test)]
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            dry_run: false,
        }
    }

    /// 列出所有数字命名的目录，即所有 PID
    fn list_pids(&self) -> Vec<i32> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut pids: Vec<i32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        pids
    }

    /// 读取进程名（comm 文件末尾带换行）
    fn process_name(&self, pid: i32) -> Option<String> {
        let comm = self.root.join(pid.to_string()).join("comm");
        fs::read_to_string(comm)
            .ok()
            .map(|s| s.trim_end().to_string())
    }

    /// argv[0] 的文件名部分，内核线程或已退出的进程返回 None
    fn command_basename(&self, pid: i32) -> Option<String> {
        let cmdline = fs::read(self.root.join(pid.to_string()).join("cmdline")).ok()?;
        let argv0 = cmdline.split(|&b| b == 0).next().filter(|a| !a.is_empty())?;
        let argv0 = String::from_utf8_lossy(argv0);
        Path::new(argv0.as_ref())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    fn name_matches(&self, pid: i32, name: &str) -> bool {
        let Some(comm) = self.process_name(pid) else {
            return false;
        };
        if name.len() <= COMM_MAX_LEN {
            return comm == name;
        }

        // comm 被截断为前 15 字节，再用 argv[0] 确认全名
        if comm.len() != COMM_MAX_LEN || !name.as_bytes().starts_with(comm.as_bytes()) {
            return false;
        }
        match self.command_basename(pid) {
            Some(base) => base == name,
            None => true,
        }
    }
}

impl Default for ProcFsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry for ProcFsRegistry {
    fn find_by_name(&self, name: &str) -> Option<i32> {
        // 有多个同名进程时取 PID 最小的主进程
        self.list_pids()
            .into_iter()
            .find(|&pid| self.name_matches(pid, name))
    }

    fn signal_reload(&self, pid: i32) -> Result<()> {
        if self.dry_run {
            println!("kill -HUP {}", pid);
            return Ok(());
        }

        // SAFETY: kill 只读取两个整数参数
        let ret = unsafe { libc::kill(pid, libc::SIGHUP) };
        if ret != 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to send SIGHUP to PID {}", pid));
        }
        Ok(())
    }
}

// ========================================
// 用户查询
// ========================================

/// 把用户名解析为 uid
///
/// 使用可重入的 `getpwnam_r`，缓冲区不足时自动扩容。
pub fn lookup_uid(user: &str) -> Result<u32, RedirectError> {
    let unknown = || RedirectError::RelayUserUnknown(user.to_string());
    let c_user = CString::new(user).map_err(|_| unknown())?;

    let mut buf_len = 1024usize;
    loop {
        let mut buf: Vec<libc::c_char> = vec![0; buf_len];
        // SAFETY: passwd 为纯数据结构，全零是合法初始值
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        // SAFETY: 所有指针都指向本栈帧内有效的内存，buf 长度与 buf_len 一致
        let ret = unsafe {
            libc::getpwnam_r(
                c_user.as_ptr(),
                &mut pwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };

        if ret == libc::ERANGE && buf_len < 1 << 20 {
            buf_len *= 2;
            continue;
        }
        if ret != 0 || result.is_null() {
            return Err(unknown());
        }
        return Ok(pwd.pw_uid);
    }
}

/// 当前进程是否以 root 运行
pub fn is_root() -> bool {
    // SAFETY: geteuid 无参数且总是成功
    unsafe { libc::geteuid() == 0 }
}

// ========================================
// 服务管理
// ========================================

/// 通过 systemctl 重启服务
pub fn restart_service(unit: &str) -> Result<()> {
    let status = Command::new("systemctl")
        .args(["restart", unit])
        .status()
        .context("Failed to execute systemctl")?;

    if !status.success() {
        anyhow::bail!("systemctl restart {} failed with status: {}", unit, status);
    }
    Ok(())
}
