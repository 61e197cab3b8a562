//! Interactive session over a mounted image.

use crate::render;
use anyhow::{Context, Result, bail};
use e2fs::{BlockDevice, E2fsError, Ext2Fs, InodeNumber};
use std::io::{self, Write};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Current directory bookkeeping plus the mounted engine.
pub struct Session<D: BlockDevice> {
    fs: Ext2Fs<D>,
    cwd: InodeNumber,
    cwd_path: String,
}

/// Apply `arg` to `base`, folding `.` and `..`.
fn join_path(base: &str, arg: &str) -> String {
    let mut parts: Vec<&str> = if arg.starts_with('/') {
        Vec::new()
    } else {
        base.split('/').filter(|c| !c.is_empty()).collect()
    };
    for component in arg.split('/').filter(|c| !c.is_empty()) {
        match component {
            "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    format!("/{}", parts.join("/"))
}

impl<D: BlockDevice> Session<D> {
    pub fn new(fs: Ext2Fs<D>) -> Self {
        Self {
            fs,
            cwd: InodeNumber::ROOT,
            cwd_path: "/".to_owned(),
        }
    }

    pub fn prompt(&self) -> String {
        format!("ext2shell:[{}] $ ", self.cwd_path)
    }

    pub fn cwd_path(&self) -> &str {
        &self.cwd_path
    }

    pub fn fs(&self) -> &Ext2Fs<D> {
        &self.fs
    }

    /// Flush and unmount.
    pub fn close(self) -> e2fs::Result<()> {
        self.fs.close()
    }

    /// Run one command line. Command failures are printed to `out`;
    /// only failures writing to `out` itself are returned.
    pub fn execute(&mut self, line: &str, out: &mut impl Write) -> Result<Flow> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            return Ok(Flow::Continue);
        };
        debug!(command, ?args, "shell command");
        match self.dispatch(command, args, out) {
            Ok(flow) => Ok(flow),
            Err(err) if err.is::<io::Error>() => Err(err),
            Err(err) => {
                writeln!(out, "error: {err:#}")?;
                Ok(Flow::Continue)
            }
        }
    }

    fn dispatch(&mut self, command: &str, args: &[&str], out: &mut impl Write) -> Result<Flow> {
        match (command, args) {
            ("exit" | "quit" | "sair", _) => return Ok(Flow::Exit),
            ("help", _) => print_help(out)?,
            ("pwd", _) => writeln!(out, "{}", self.cwd_path)?,
            ("cd", []) => {
                self.cwd = InodeNumber::ROOT;
                "/".clone_into(&mut self.cwd_path);
            }
            ("cd", [target]) => self.cd(target)?,
            ("info", []) => render::info(out, &self.fs.info())?,
            ("info", ["--json"]) => {
                writeln!(out, "{}", serde_json::to_string_pretty(&self.fs.info())?)?;
            }
            ("ls", []) => render::ls(out, &self.fs.list_dir(self.cwd, "")?)?,
            ("ls", [path]) => render::ls(out, &self.fs.list_dir(self.cwd, path)?)?,
            ("attr", [path]) => render::attr(out, &self.fs.attr(self.cwd, path)?)?,
            ("cat", [path]) => {
                let mut buf = Vec::new();
                self.fs.cat(self.cwd, path, &mut buf)?;
                out.write_all(&buf)?;
                writeln!(out)?;
            }
            ("cp", [source, host]) => {
                let written = self.fs.copy_out(self.cwd, source, Path::new(host))?;
                writeln!(out, "copied {written} bytes to {host}")?;
            }
            ("touch", [path]) => {
                self.fs.touch(self.cwd, path)?;
            }
            ("mkdir", [path]) => {
                self.fs.mkdir(self.cwd, path)?;
            }
            ("rm", [path]) => self.fs.rm(self.cwd, path)?,
            ("rmdir", [path]) => self.fs.rmdir(self.cwd, path)?,
            ("rename" | "mv", [path, new_name]) => self.fs.rename(self.cwd, path, new_name)?,
            ("print", ["superblock"]) => render::superblock(out, self.fs.superblock())?,
            ("print", ["groups"]) => render::groups(out, self.fs.groups())?,
            ("print", ["inode", raw]) => {
                let ino = InodeNumber(raw.parse().with_context(|| format!("invalid inode number: {raw}"))?);
                render::inode(out, ino, &self.fs.get_inode(ino)?)?;
            }
            (
                "cd" | "info" | "ls" | "attr" | "cat" | "cp" | "touch" | "mkdir" | "rm" | "rmdir"
                | "rename" | "mv" | "print",
                _,
            ) => bail!("wrong arguments for {command}; type `help`"),
            _ => bail!("unknown command: {command}"),
        }
        Ok(Flow::Continue)
    }

    fn cd(&mut self, target: &str) -> Result<()> {
        let ino = self.fs.lookup(target, self.cwd)?;
        if !self.fs.get_inode(ino)?.is_dir() {
            return Err(E2fsError::NotDirectory(target.to_owned()).into());
        }
        self.cwd = ino;
        self.cwd_path = join_path(&self.cwd_path, target);
        Ok(())
    }
}

fn print_help(out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "info [--json]              filesystem summary")?;
    writeln!(out, "ls [path]                  list directory entries")?;
    writeln!(out, "cd [path] | pwd            change or show the current directory")?;
    writeln!(out, "attr <path>                permissions, owner, size, mtime")?;
    writeln!(out, "cat <path>                 print a regular file")?;
    writeln!(out, "cp <image-path> <host>     copy a file out of the image")?;
    writeln!(out, "touch <path>               create an empty file")?;
    writeln!(out, "mkdir <path>               create a directory")?;
    writeln!(out, "rm <path>                  remove a file")?;
    writeln!(out, "rmdir <path>               remove an empty directory")?;
    writeln!(out, "rename|mv <path> <name>    rename within the same directory")?;
    writeln!(out, "print superblock|groups|inode <n>")?;
    writeln!(out, "exit | quit | sair")
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2fs::{ByteBlockDevice, MemoryByteDevice};
    use e2fs_harness::{ImageSpec, install_file, mount_image, patterned_bytes};

    fn session() -> Session<ByteBlockDevice<MemoryByteDevice>> {
        let (_, fs) = mount_image(&ImageSpec::default()).expect("image");
        Session::new(fs)
    }

    fn run(session: &mut Session<ByteBlockDevice<MemoryByteDevice>>, line: &str) -> String {
        let mut out = Vec::new();
        session.execute(line, &mut out).expect("execute");
        String::from_utf8(out).expect("utf8")
    }

    #[test]
    fn join_path_folds_dots() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a/b", ".."), "/a");
        assert_eq!(join_path("/a", "./b/../c"), "/a/c");
        assert_eq!(join_path("/a/b", "/x"), "/x");
        assert_eq!(join_path("/", ".."), "/");
    }

    #[test]
    fn prompt_tracks_cd() {
        let mut s = session();
        assert_eq!(s.prompt(), "ext2shell:[/] $ ");
        run(&mut s, "mkdir docs");
        run(&mut s, "cd docs");
        assert_eq!(s.prompt(), "ext2shell:[/docs] $ ");
        assert_eq!(run(&mut s, "pwd"), "/docs\n");
        run(&mut s, "cd ..");
        assert_eq!(s.cwd_path(), "/");
        run(&mut s, "cd docs");
        run(&mut s, "cd");
        assert_eq!(s.cwd_path(), "/");
    }

    #[test]
    fn cd_into_file_is_refused() {
        let mut s = session();
        run(&mut s, "touch f");
        let text = run(&mut s, "cd f");
        assert!(text.starts_with("error:"), "{text}");
        assert_eq!(s.cwd_path(), "/");
    }

    #[test]
    fn failures_keep_the_session_running() {
        let mut s = session();
        assert!(run(&mut s, "rm missing").starts_with("error:"));
        assert!(run(&mut s, "bogus").contains("unknown command"));
        assert!(run(&mut s, "rename onlyone").contains("wrong arguments"));
        let mut out = Vec::new();
        assert_eq!(s.execute("ls", &mut out).expect("ls"), Flow::Continue);
    }

    #[test]
    fn exit_words_end_the_session() {
        let mut s = session();
        for word in ["exit", "quit", "sair"] {
            let mut out = Vec::new();
            assert_eq!(s.execute(word, &mut out).expect("exit"), Flow::Exit);
        }
        let mut out = Vec::new();
        assert_eq!(s.execute("   ", &mut out).expect("blank"), Flow::Continue);
    }

    #[test]
    fn file_commands_round_trip() {
        let mut s = session();
        run(&mut s, "touch a.txt");
        assert!(run(&mut s, "ls").contains("a.txt\n"));
        run(&mut s, "mv a.txt b.txt");
        let listing = run(&mut s, "ls /");
        assert!(listing.contains("b.txt\n"));
        assert!(!listing.contains("a.txt"));
        assert!(run(&mut s, "attr b.txt").contains("0 bytes"));
        run(&mut s, "rm b.txt");
        assert!(!run(&mut s, "ls").contains("b.txt"));
    }

    #[test]
    fn cat_appends_newline() {
        let (_, mut fs) = mount_image(&ImageSpec::default()).expect("image");
        let data = patterned_bytes(1500, 3);
        install_file(&mut fs, InodeNumber::ROOT, "data", &data).expect("install");
        let mut s = Session::new(fs);
        let mut out = Vec::new();
        s.execute("cat data", &mut out).expect("cat");
        assert_eq!(out.len(), data.len() + 1);
        assert_eq!(&out[..data.len()], &data[..]);
    }

    #[test]
    fn cp_writes_host_file() {
        let (_, mut fs) = mount_image(&ImageSpec::default()).expect("image");
        let data = patterned_bytes(3000, 8);
        install_file(&mut fs, InodeNumber::ROOT, "blob", &data).expect("install");
        let mut s = Session::new(fs);
        let dir = tempfile::tempdir().expect("tempdir");
        let host = dir.path().join("blob.out");
        let text = run(&mut s, &format!("cp blob {}", host.display()));
        assert!(text.starts_with("copied 3000 bytes"), "{text}");
        assert_eq!(std::fs::read(&host).expect("read host"), data);
    }

    #[test]
    fn info_json_is_parseable() {
        let mut s = session();
        let text = run(&mut s, "info --json");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["volume_name"], "e2fs-test");
    }

    #[test]
    fn print_reports() {
        let mut s = session();
        assert!(run(&mut s, "print superblock").contains("magic signature: 0xef53"));
        assert!(run(&mut s, "print groups").contains("Block Group Descriptor: 0"));
        assert!(run(&mut s, "print inode 2").contains("inode: 2"));
        assert!(run(&mut s, "print inode x").starts_with("error:"));
    }
}
