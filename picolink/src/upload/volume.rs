//! Bootloader drive discovery.
//!
//! While in its UF2 bootloader the device exposes a FAT mass-storage volume
//! (label `RPI-RP2` on the RP2040). Finding where the host mounted it is
//! the one genuinely platform-specific part of the engine, so the OS
//! facilities sit behind a single [`VolumeInspector`] capability selected
//! at startup: Windows queries volume labels natively, POSIX scans the
//! mount table with path heuristics, and Linux can additionally mount a
//! discovered-but-unmounted device with elevated privileges.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

/// Platform capability for matching a volume label to a mount path.
pub trait VolumeInspector {
    /// A currently mounted volume whose label (or mount/device identifier)
    /// matches `label`, case-insensitively.
    fn labeled_volume(&self, label: &str) -> Option<PathBuf>;

    /// Heuristic: a FAT-family volume under a conventional removable-media
    /// root, accepted even without a label hit.
    fn removable_fallback(&self) -> Option<PathBuf>;

    /// Mount a discovered-but-unmounted device whose label matches and
    /// return the new mount path. Only Linux implements this.
    fn mount_unmounted(&self, _label: &str) -> Option<PathBuf> {
        None
    }
}

/// The inspector for the compile-time platform.
#[must_use]
pub fn platform_inspector() -> Box<dyn VolumeInspector + Send + Sync> {
    #[cfg(windows)]
    {
        Box::new(LogicalDriveInspector)
    }
    #[cfg(unix)]
    {
        Box::new(MountTableInspector)
    }
}

/// Poll for the bootloader drive until it appears, `timeout` elapses, or
/// `cancelled` returns true.
///
/// Per poll the match priority is: mounted-and-labeled, then
/// unmounted-discovered-and-mounted, then the removable-FAT heuristic.
pub fn locate<C>(
    inspector: &dyn VolumeInspector,
    label: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut cancelled: C,
) -> Option<PathBuf>
where
    C: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;

    loop {
        if cancelled() {
            debug!("Drive search cancelled");
            return None;
        }

        if let Some(mount) = inspector.labeled_volume(label) {
            info!("Found labeled volume at {}", mount.display());
            return Some(mount);
        }
        if let Some(mount) = inspector.mount_unmounted(label) {
            info!("Mounted bootloader device at {}", mount.display());
            return Some(mount);
        }
        if let Some(mount) = inspector.removable_fallback() {
            info!("Using removable FAT volume at {}", mount.display());
            return Some(mount);
        }

        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(poll_interval);
    }
}

/// One row of the host's mount table.
#[cfg(any(unix, test))]
#[derive(Debug, Clone)]
struct MountEntry {
    device: String,
    mount_point: PathBuf,
    fstype: String,
}

/// Mounted-volume label match against `entries`.
///
/// A hit is the label appearing (case-insensitively) in the mount point's
/// final path component, or anywhere in the device identifier or mount
/// path — USB mass-storage ends up mounted as `/media/<user>/<LABEL>` on
/// most desktop Linux setups.
#[cfg(any(unix, test))]
fn match_mounted(entries: &[MountEntry], label: &str) -> Option<PathBuf> {
    let needle = label.to_lowercase();

    for entry in entries {
        let basename = entry
            .mount_point
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !basename.is_empty() && basename.contains(&needle) {
            return Some(entry.mount_point.clone());
        }

        let mount_str = entry.mount_point.to_string_lossy().to_lowercase();
        if entry.device.to_lowercase().contains(&needle) || mount_str.contains(&needle) {
            return Some(entry.mount_point.clone());
        }
    }

    None
}

/// Removable-media heuristic: FAT-family filesystem mounted under `/media`
/// or `/run/media`.
#[cfg(any(unix, test))]
fn match_removable_fat(entries: &[MountEntry]) -> Option<PathBuf> {
    entries
        .iter()
        .find(|entry| {
            let mount_str = entry.mount_point.to_string_lossy();
            (mount_str.starts_with("/media") || mount_str.starts_with("/run/media"))
                && is_fat_family(&entry.fstype)
        })
        .map(|entry| entry.mount_point.clone())
}

#[cfg(any(unix, test))]
fn is_fat_family(fstype: &str) -> bool {
    let fstype = fstype.to_lowercase();
    fstype.contains("fat") || fstype == "msdos"
}

// ---- POSIX mount-table inspector ----

/// Inspector backed by the host's mount table.
#[cfg(unix)]
pub struct MountTableInspector;

#[cfg(unix)]
impl VolumeInspector for MountTableInspector {
    fn labeled_volume(&self, label: &str) -> Option<PathBuf> {
        match_mounted(&mounted_volumes(), label)
    }

    fn removable_fallback(&self) -> Option<PathBuf> {
        match_removable_fat(&mounted_volumes())
    }

    #[cfg(target_os = "linux")]
    fn mount_unmounted(&self, label: &str) -> Option<PathBuf> {
        linux_mount_unmounted(label)
    }
}

#[cfg(target_os = "linux")]
fn mounted_volumes() -> Vec<MountEntry> {
    let Ok(table) = std::fs::read_to_string("/proc/mounts") else {
        return Vec::new();
    };

    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                device: device.to_string(),
                mount_point: PathBuf::from(decode_mount_escapes(mount_point)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// `/proc/mounts` escapes whitespace in paths as octal (`\040` for space).
#[cfg(target_os = "linux")]
fn decode_mount_escapes(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.by_ref().take(3).collect();
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                continue;
            }
            out.push(c);
            out.push_str(&digits);
        } else {
            out.push(c);
        }
    }
    out
}

/// macOS and the BSDs mount removable volumes under `/Volumes`.
#[cfg(all(unix, not(target_os = "linux")))]
fn mounted_volumes() -> Vec<MountEntry> {
    let Ok(entries) = std::fs::read_dir("/Volumes") else {
        return Vec::new();
    };

    entries
        .flatten()
        .map(|entry| MountEntry {
            device: String::new(),
            mount_point: entry.path(),
            fstype: String::new(),
        })
        .collect()
}

// ---- Linux unmounted block-device fallback ----

/// Headless hosts often have no automounter; the bootloader device shows
/// up in the block-device table but nothing mounts it. Find it via lsblk
/// and mount it ourselves under /mnt.
#[cfg(target_os = "linux")]
fn linux_mount_unmounted(label: &str) -> Option<PathBuf> {
    use std::process::Command;

    let output = Command::new("lsblk")
        .args(["-P", "-o", "NAME,LABEL,MOUNTPOINT"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let needle = label.to_lowercase();
    let text = String::from_utf8_lossy(&output.stdout);

    for line in text.lines() {
        let fields = parse_lsblk_pairs(line);
        let (Some(name), Some(dev_label)) = (fields_get(&fields, "NAME"), fields_get(&fields, "LABEL"))
        else {
            continue;
        };
        let mounted = fields_get(&fields, "MOUNTPOINT").is_some_and(|m| !m.is_empty());

        if !mounted && !dev_label.is_empty() && dev_label.to_lowercase().contains(&needle) {
            let target = PathBuf::from("/mnt").join(dev_label);
            if privileged_mount(&format!("/dev/{name}"), &target) {
                return Some(target);
            }
        }
    }

    None
}

#[cfg(target_os = "linux")]
fn fields_get<'a>(fields: &'a [(String, String)], key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Parse one `KEY="VALUE" KEY="VALUE"` line of `lsblk -P` output.
#[cfg(target_os = "linux")]
fn parse_lsblk_pairs(line: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = line.trim();

    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim().to_string();
        let after = &rest[eq + 2..];
        let Some(close) = after.find('"') else { break };
        pairs.push((key, after[..close].to_string()));
        rest = &after[close + 1..];
    }

    pairs
}

#[cfg(target_os = "linux")]
fn privileged_mount(device: &str, target: &std::path::Path) -> bool {
    use log::warn;
    use std::process::Command;

    let mkdir = Command::new("sudo")
        .args(["mkdir", "-p"])
        .arg(target)
        .status();
    if !mkdir.map(|s| s.success()).unwrap_or(false) {
        warn!("Could not create mount point {}", target.display());
        return false;
    }

    match Command::new("sudo").arg("mount").arg(device).arg(target).status() {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!("mount {device} {} exited with {status}", target.display());
            false
        },
        Err(e) => {
            warn!("Could not run mount for {device}: {e}");
            false
        },
    }
}

// ---- Windows logical-drive inspector ----

/// Inspector backed by `GetLogicalDrives` + `GetVolumeInformationW`.
#[cfg(windows)]
pub struct LogicalDriveInspector;

#[cfg(windows)]
impl VolumeInspector for LogicalDriveInspector {
    fn labeled_volume(&self, label: &str) -> Option<PathBuf> {
        let needle = label.to_lowercase();
        for root in drive_roots() {
            if let Some(volume) = volume_label(&root) {
                if volume.to_lowercase().contains(&needle) {
                    return Some(PathBuf::from(root));
                }
            }
        }
        None
    }

    fn removable_fallback(&self) -> Option<PathBuf> {
        // The native label query is authoritative here; no heuristic.
        None
    }
}

#[cfg(windows)]
fn drive_roots() -> Vec<String> {
    #[allow(unsafe_code)] // Win32 FFI
    let mask = unsafe { windows_sys::Win32::Storage::FileSystem::GetLogicalDrives() };
    (0..26u32)
        .filter(|bit| mask & (1 << bit) != 0)
        .map(|bit| format!("{}:\\", char::from(b'A' + bit as u8)))
        .collect()
}

#[cfg(windows)]
fn volume_label(root: &str) -> Option<String> {
    use windows_sys::Win32::Storage::FileSystem::GetVolumeInformationW;

    let root_wide: Vec<u16> = root.encode_utf16().chain(std::iter::once(0)).collect();
    let mut name_buf = [0u16; 261];

    #[allow(unsafe_code)] // Win32 FFI
    let ok = unsafe {
        GetVolumeInformationW(
            root_wide.as_ptr(),
            name_buf.as_mut_ptr(),
            name_buf.len() as u32,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        )
    };
    if ok == 0 {
        return None;
    }

    let len = name_buf.iter().position(|&c| c == 0).unwrap_or(name_buf.len());
    Some(String::from_utf16_lossy(&name_buf[..len]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(device: &str, mount: &str, fstype: &str) -> MountEntry {
        MountEntry {
            device: device.to_string(),
            mount_point: PathBuf::from(mount),
            fstype: fstype.to_string(),
        }
    }

    // ---- match_mounted ----

    #[test]
    fn test_match_mounted_by_basename() {
        let entries = vec![
            entry("/dev/sda1", "/", "ext4"),
            entry("/dev/sdb1", "/media/pi/RPI-RP2", "vfat"),
        ];
        assert_eq!(
            match_mounted(&entries, "RPI-RP2"),
            Some(PathBuf::from("/media/pi/RPI-RP2"))
        );
    }

    #[test]
    fn test_match_mounted_case_insensitive() {
        let entries = vec![entry("/dev/sdb1", "/media/pi/rpi-rp2", "vfat")];
        assert_eq!(
            match_mounted(&entries, "RPI-RP2"),
            Some(PathBuf::from("/media/pi/rpi-rp2"))
        );
    }

    #[test]
    fn test_match_mounted_by_device_substring() {
        let entries = vec![entry("/dev/disk/by-label/RPI-RP2", "/mnt/pico", "vfat")];
        assert_eq!(
            match_mounted(&entries, "RPI-RP2"),
            Some(PathBuf::from("/mnt/pico"))
        );
    }

    #[test]
    fn test_match_mounted_no_hit() {
        let entries = vec![entry("/dev/sda1", "/", "ext4"), entry("tmpfs", "/tmp", "tmpfs")];
        assert_eq!(match_mounted(&entries, "RPI-RP2"), None);
    }

    // ---- removable heuristic ----

    #[test]
    fn test_removable_fat_under_media() {
        let entries = vec![
            entry("/dev/sda1", "/", "ext4"),
            entry("/dev/sdb1", "/media/pi/UNTITLED", "vfat"),
        ];
        assert_eq!(
            match_removable_fat(&entries),
            Some(PathBuf::from("/media/pi/UNTITLED"))
        );
    }

    #[test]
    fn test_removable_fat_under_run_media() {
        let entries = vec![entry("/dev/sdb1", "/run/media/user/disk", "FAT32")];
        assert_eq!(
            match_removable_fat(&entries),
            Some(PathBuf::from("/run/media/user/disk"))
        );
    }

    #[test]
    fn test_removable_requires_fat_family() {
        let entries = vec![entry("/dev/sdb1", "/media/pi/backup", "ext4")];
        assert_eq!(match_removable_fat(&entries), None);
    }

    #[test]
    fn test_removable_requires_media_root() {
        let entries = vec![entry("/dev/sdb1", "/home/pi/disk", "vfat")];
        assert_eq!(match_removable_fat(&entries), None);
    }

    #[test]
    fn test_is_fat_family() {
        assert!(is_fat_family("vfat"));
        assert!(is_fat_family("FAT32"));
        assert!(is_fat_family("exfat"));
        assert!(is_fat_family("msdos"));
        assert!(!is_fat_family("ext4"));
        assert!(!is_fat_family("ntfs"));
    }

    // ---- locate priority & bounds ----

    struct ScriptedInspector {
        labeled: Option<PathBuf>,
        mounted: Option<PathBuf>,
        fallback: Option<PathBuf>,
    }

    impl VolumeInspector for ScriptedInspector {
        fn labeled_volume(&self, _label: &str) -> Option<PathBuf> {
            self.labeled.clone()
        }

        fn removable_fallback(&self) -> Option<PathBuf> {
            self.fallback.clone()
        }

        fn mount_unmounted(&self, _label: &str) -> Option<PathBuf> {
            self.mounted.clone()
        }
    }

    #[test]
    fn test_locate_prefers_labeled_over_fallback() {
        let inspector = ScriptedInspector {
            labeled: Some(PathBuf::from("/media/pi/RPI-RP2")),
            mounted: Some(PathBuf::from("/mnt/RPI-RP2")),
            fallback: Some(PathBuf::from("/media/pi/other")),
        };
        let found = locate(
            &inspector,
            "RPI-RP2",
            Duration::from_millis(50),
            Duration::from_millis(5),
            || false,
        );
        assert_eq!(found, Some(PathBuf::from("/media/pi/RPI-RP2")));
    }

    #[test]
    fn test_locate_prefers_mounted_over_heuristic() {
        let inspector = ScriptedInspector {
            labeled: None,
            mounted: Some(PathBuf::from("/mnt/RPI-RP2")),
            fallback: Some(PathBuf::from("/media/pi/other")),
        };
        let found = locate(
            &inspector,
            "RPI-RP2",
            Duration::from_millis(50),
            Duration::from_millis(5),
            || false,
        );
        assert_eq!(found, Some(PathBuf::from("/mnt/RPI-RP2")));
    }

    #[test]
    fn test_locate_times_out() {
        let inspector = ScriptedInspector {
            labeled: None,
            mounted: None,
            fallback: None,
        };
        let start = Instant::now();
        let found = locate(
            &inspector,
            "RPI-RP2",
            Duration::from_millis(30),
            Duration::from_millis(5),
            || false,
        );
        assert_eq!(found, None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_locate_cancellation_is_immediate() {
        let inspector = ScriptedInspector {
            labeled: Some(PathBuf::from("/media/pi/RPI-RP2")),
            mounted: None,
            fallback: None,
        };
        // Cancelled before the first poll: no result even though a volume
        // is available.
        let found = locate(
            &inspector,
            "RPI-RP2",
            Duration::from_secs(5),
            Duration::from_millis(5),
            || true,
        );
        assert_eq!(found, None);
    }

    // ---- lsblk parsing (linux) ----

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_lsblk_pairs() {
        let line = r#"NAME="sdb1" LABEL="RPI-RP2" MOUNTPOINT="""#;
        let fields = parse_lsblk_pairs(line);
        assert_eq!(fields_get(&fields, "NAME"), Some("sdb1"));
        assert_eq!(fields_get(&fields, "LABEL"), Some("RPI-RP2"));
        assert_eq!(fields_get(&fields, "MOUNTPOINT"), Some(""));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_lsblk_pairs_with_spaces_in_value() {
        let line = r#"NAME="sda1" LABEL="My Disk" MOUNTPOINT="/media/user/My Disk""#;
        let fields = parse_lsblk_pairs(line);
        assert_eq!(fields_get(&fields, "LABEL"), Some("My Disk"));
        assert_eq!(fields_get(&fields, "MOUNTPOINT"), Some("/media/user/My Disk"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_decode_mount_escapes() {
        assert_eq!(decode_mount_escapes(r"/media/pi/My\040Disk"), "/media/pi/My Disk");
        assert_eq!(decode_mount_escapes("/plain/path"), "/plain/path");
    }
}
