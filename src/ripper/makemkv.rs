//! `makemkvcon` driver. Everything goes through robot mode (`-r`), which
//! prints one machine-readable record per line.

use super::{RipError, Ripper, RippedFile, Result, collect_outputs};
use crate::disc::{DiscTitle, Drive, ScannedDisc};
use indicatif::ProgressBar;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

// CINFO/TINFO attribute ids
const ATTR_NAME: u32 = 2;
const ATTR_CHAPTER_COUNT: u32 = 8;
const ATTR_DURATION: u32 = 9;
const ATTR_SIZE_BYTES: u32 = 11;
const ATTR_OUTPUT_FILE: u32 = 27;
const ATTR_VOLUME_NAME: u32 = 32;

/// DRV state for a drive with a readable disc.
const DRIVE_STATE_INSERTED: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum RobotLine {
    Drive {
        index: u32,
        state: u32,
        name: String,
        label: String,
        device: String,
    },
    DiscInfo {
        attr: u32,
        value: String,
    },
    TitleCount(u32),
    TitleInfo {
        title: u32,
        attr: u32,
        value: String,
    },
    Progress {
        current: u64,
        total: u64,
        max: u64,
    },
    Message {
        code: u32,
        text: String,
    },
}

/// Parse one robot-mode line. Unknown record types give `None`.
pub fn parse_robot_line(line: &str) -> Option<RobotLine> {
    let (kind, rest) = line.trim_end().split_once(':')?;
    let f = split_fields(rest);
    let num = |i: usize| f.get(i).and_then(|s| s.parse::<u64>().ok());
    let text = |i: usize| f.get(i).cloned().unwrap_or_default();

    match kind {
        "DRV" => Some(RobotLine::Drive {
            index: num(0)? as u32,
            state: num(1)? as u32,
            name: text(4),
            label: text(5),
            device: text(6),
        }),
        "CINFO" => Some(RobotLine::DiscInfo {
            attr: num(0)? as u32,
            value: text(2),
        }),
        "TCOUT" => Some(RobotLine::TitleCount(num(0)? as u32)),
        "TINFO" => Some(RobotLine::TitleInfo {
            title: num(0)? as u32,
            attr: num(1)? as u32,
            value: text(3),
        }),
        "PRGV" => Some(RobotLine::Progress {
            current: num(0)?,
            total: num(1)?,
            max: num(2)?,
        }),
        "MSG" => Some(RobotLine::Message {
            code: num(0)? as u32,
            text: text(3),
        }),
        _ => None,
    }
}

/// Comma-separated fields; double-quoted fields may contain commas and
/// `\"`.
fn split_fields(s: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes && chars.peek() == Some(&'"') => {
                cur.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    fields.push(cur);
    fields
}

/// "1:02:03" → 3723.
fn parse_duration(s: &str) -> Option<u64> {
    s.split(':')
        .try_fold(0u64, |acc, part| part.trim().parse::<u64>().ok().map(|n| acc * 60 + n))
}

/// Drives reported by an `info disc:9999` run.
pub fn drives_from_lines(lines: &[RobotLine]) -> Vec<Drive> {
    lines
        .iter()
        .filter_map(|l| match l {
            RobotLine::Drive {
                index,
                state,
                name,
                label,
                device,
            } if !name.is_empty() => Some(Drive {
                index: *index,
                name: name.clone(),
                device: device.clone(),
                disc_label: (*state == DRIVE_STATE_INSERTED && !label.is_empty())
                    .then(|| label.clone()),
            }),
            _ => None,
        })
        .collect()
}

/// Assemble a scanned disc from an `info disc:N` run.
pub fn disc_from_lines(drive: &Drive, lines: &[RobotLine]) -> ScannedDisc {
    let mut volume_name = None;
    let mut disc_name = None;
    let mut titles: Vec<DiscTitle> = Vec::new();

    for line in lines {
        match line {
            RobotLine::DiscInfo { attr, value } if *attr == ATTR_VOLUME_NAME => {
                volume_name = Some(value.clone())
            }
            RobotLine::DiscInfo { attr, value } if *attr == ATTR_NAME => {
                disc_name = Some(value.clone())
            }
            RobotLine::TitleInfo { title, attr, value } => {
                let pos = match titles.iter().position(|t| t.index == *title) {
                    Some(p) => p,
                    None => {
                        titles.push(DiscTitle {
                            index: *title,
                            name: String::new(),
                            duration_secs: 0,
                            size_bytes: 0,
                            chapter_count: 0,
                            output_file: None,
                        });
                        titles.len() - 1
                    }
                };
                let t = &mut titles[pos];
                match *attr {
                    ATTR_NAME => t.name = value.clone(),
                    ATTR_CHAPTER_COUNT => t.chapter_count = value.parse().unwrap_or(0),
                    ATTR_DURATION => t.duration_secs = parse_duration(value).unwrap_or(0),
                    ATTR_SIZE_BYTES => t.size_bytes = value.parse().unwrap_or(0),
                    ATTR_OUTPUT_FILE => t.output_file = Some(value.clone()),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    titles.sort_by_key(|t| t.index);
    let label = drive
        .disc_label
        .clone()
        .filter(|l| !l.is_empty())
        .or(volume_name)
        .or(disc_name)
        .unwrap_or_else(|| format!("DISC_{}", drive.index));

    ScannedDisc {
        drive: drive.clone(),
        label,
        titles,
    }
}

pub struct MakeMkv {
    binary: PathBuf,
    min_title_secs: u64,
}

impl MakeMkv {
    pub fn new(binary: impl Into<PathBuf>, min_title_secs: u64) -> Self {
        Self {
            binary: binary.into(),
            min_title_secs,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-r")
            .arg(format!("--minlength={}", self.min_title_secs));
        // Own process group: a terminal Ctrl-C stops the watcher between
        // discs instead of killing a rip in progress.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }

    fn tool_name(&self) -> String {
        self.binary.display().to_string()
    }

    fn map_spawn_error(&self, e: std::io::Error) -> RipError {
        if e.kind() == std::io::ErrorKind::NotFound {
            RipError::ToolNotFound(self.tool_name())
        } else {
            RipError::Io(e)
        }
    }

    fn info(&self, source: &str) -> Result<Vec<RobotLine>> {
        log::debug!("{} info {source}", self.tool_name());
        let output = self
            .command()
            .args(["--cache=1", "info", source])
            .output()
            .map_err(|e| self.map_spawn_error(e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<RobotLine> = stdout.lines().filter_map(parse_robot_line).collect();

        // makemkvcon exits non-zero for an empty drive list; DRV lines are
        // still valid then
        if !output.status.success() && lines.is_empty() {
            return Err(RipError::Failed {
                tool: self.tool_name(),
                code: output.status.code(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(lines)
    }

    fn rip_title(
        &self,
        drive: &Drive,
        title: &DiscTitle,
        out_dir: &Path,
        progress: &ProgressBar,
    ) -> Result<()> {
        let mut child = self
            .command()
            .arg("--progress=-same")
            .arg("mkv")
            .arg(format!("disc:{}", drive.index))
            .arg(title.index.to_string())
            .arg(out_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.map_spawn_error(e))?;

        let mut last_message = String::new();
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                match parse_robot_line(&line) {
                    Some(RobotLine::Progress { total, max, .. }) if max > 0 => {
                        progress.set_length(max);
                        progress.set_position(total.min(max));
                    }
                    Some(RobotLine::Message { code, text }) => {
                        log::debug!("makemkv [{code}] {text}");
                        last_message = text;
                    }
                    _ => {}
                }
            }
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(RipError::Failed {
                tool: self.tool_name(),
                code: status.code(),
                message: last_message,
            });
        }
        Ok(())
    }
}

impl Ripper for MakeMkv {
    fn drives(&self) -> Result<Vec<Drive>> {
        let lines = self.info("disc:9999")?;
        Ok(drives_from_lines(&lines))
    }

    fn scan(&self, drive: &Drive) -> Result<ScannedDisc> {
        if drive.disc_label.is_none() {
            return Err(RipError::NoDisc(drive.index));
        }
        let lines = self.info(&format!("disc:{}", drive.index))?;
        let disc = disc_from_lines(drive, &lines);
        log::info!(
            "Scanned '{}' in {}: {} title(s)",
            disc.label,
            drive.device,
            disc.titles.len()
        );
        Ok(disc)
    }

    fn rip(
        &self,
        drive: &Drive,
        titles: &[DiscTitle],
        out_dir: &Path,
        progress: &ProgressBar,
    ) -> Result<Vec<RippedFile>> {
        std::fs::create_dir_all(out_dir)?;
        for (i, title) in titles.iter().enumerate() {
            progress.set_message(format!("title {}/{}", i + 1, titles.len()));
            progress.set_position(0);
            self.rip_title(drive, title, out_dir, progress)?;
        }
        progress.finish_with_message("ripped");
        collect_outputs(out_dir, titles)
    }

    fn eject(&self, drive: &Drive) -> Result<()> {
        let status = Command::new("eject")
            .arg(&drive.device)
            .status()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RipError::ToolNotFound("eject".to_string())
                } else {
                    RipError::Io(e)
                }
            })?;
        if !status.success() {
            return Err(RipError::Failed {
                tool: "eject".to_string(),
                code: status.code(),
                message: format!("could not eject {}", drive.device),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<RobotLine> {
        text.lines().filter_map(parse_robot_line).collect()
    }

    #[test]
    fn test_split_fields_quoted_commas() {
        assert_eq!(
            split_fields(r#"0,2,"Demo, the \"Show\"",x"#),
            vec!["0", "2", "Demo, the \"Show\"", "x"]
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0:44:10"), Some(2650));
        assert_eq!(parse_duration("1:02:03"), Some(3723));
        assert_eq!(parse_duration("bad"), None);
    }

    #[test]
    fn test_parse_drive_lines() {
        let out = lines(
            r#"DRV:0,2,999,12,"BD-RE HL-DT-ST","DEMO_S1_D1","/dev/sr0"
DRV:1,0,999,0,"DVD-RW","","/dev/sr1"
DRV:2,256,999,0,"","",""
MSG:5010,0,0,"Failed to open disc","",""
"#,
        );
        let drives = drives_from_lines(&out);
        assert_eq!(drives.len(), 2);
        assert_eq!(drives[0].disc_label.as_deref(), Some("DEMO_S1_D1"));
        assert_eq!(drives[0].device, "/dev/sr0");
        assert_eq!(drives[1].disc_label, None);
    }

    #[test]
    fn test_parse_progress_and_message() {
        assert_eq!(
            parse_robot_line("PRGV:100,3000,65536"),
            Some(RobotLine::Progress {
                current: 100,
                total: 3000,
                max: 65536
            })
        );
        assert_eq!(
            parse_robot_line(r#"MSG:1005,0,1,"MakeMKV started","%1 started","MakeMKV""#),
            Some(RobotLine::Message {
                code: 1005,
                text: "MakeMKV started".to_string()
            })
        );
        assert_eq!(parse_robot_line("SINFO:0,1,1,6201,\"Video\""), None);
        assert_eq!(parse_robot_line("garbage"), None);
    }

    #[test]
    fn test_disc_from_lines() {
        let drive = Drive {
            index: 0,
            name: "BD-RE".to_string(),
            device: "/dev/sr0".to_string(),
            disc_label: Some("DEMO_S1_D1".to_string()),
        };
        let out = lines(
            r#"CINFO:2,0,"Demo Show: Season 1"
CINFO:32,0,"DEMO_S1_D1"
TCOUT:2
TINFO:1,2,0,"Demo Show"
TINFO:1,9,0,"0:44:10"
TINFO:1,11,0,"7340032000"
TINFO:1,27,0,"Demo_Show_t01.mkv"
TINFO:0,9,0,"0:43:55"
TINFO:0,8,0,"6"
"#,
        );
        let disc = disc_from_lines(&drive, &out);
        assert_eq!(disc.label, "DEMO_S1_D1");
        assert_eq!(disc.titles.len(), 2);
        assert_eq!(disc.titles[0].index, 0);
        assert_eq!(disc.titles[0].duration_secs, 2635);
        assert_eq!(disc.titles[0].chapter_count, 6);
        assert_eq!(disc.titles[1].size_bytes, 7_340_032_000);
        assert_eq!(disc.titles[1].output_file.as_deref(), Some("Demo_Show_t01.mkv"));
    }

    #[test]
    fn test_label_falls_back_to_volume_name() {
        let drive = Drive {
            index: 3,
            name: "BD".to_string(),
            device: "/dev/sr3".to_string(),
            disc_label: None,
        };
        let disc = disc_from_lines(&drive, &lines("CINFO:32,0,\"VOLUME\""));
        assert_eq!(disc.label, "VOLUME");
        assert_eq!(disc_from_lines(&drive, &[]).label, "DISC_3");
    }

    #[test]
    fn test_missing_binary_is_tool_not_found() {
        let mkv = MakeMkv::new("/nonexistent/makemkvcon", 600);
        assert!(matches!(mkv.drives(), Err(RipError::ToolNotFound(_))));
    }
}
