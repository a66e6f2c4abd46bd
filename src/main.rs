//! Interactive shell over a disk-image file: every command maps onto one
//! filesystem operation, plus `copyin`/`copyout`/`cat` which stream whole
//! files through the block-sized read/write path. The image named on the
//! command line is loaded at startup and written back on exit.

use std::env;
use std::fs::File;
use std::io::{self, BufRead, Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use thiserror_no_std::Error;

use minnowfs::{Disk, FileSystem, FsError, Inumber, BLOCK_SIZE};

#[derive(Error, Debug)]
enum ShellError {
    #[error("unknown command: {0} (try `help`)")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("{0}")]
    Fs(#[from] FsError),
    #[error("{0}")]
    Io(#[from] io::Error),
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let (image, nblocks) = match &args[..] {
        [_, image, nblocks] => match nblocks.parse::<usize>() {
            Ok(n) if n >= 3 => (PathBuf::from(image), n),
            _ => {
                eprintln!("nblocks must be an integer of at least 3");
                return ExitCode::FAILURE;
            }
        },
        _ => {
            eprintln!("usage: minnowfs <image> <nblocks>");
            return ExitCode::FAILURE;
        }
    };

    let disk = match load_image(&image, nblocks) {
        Ok(disk) => disk,
        Err(err) => {
            eprintln!("cannot open {}: {err}", image.display());
            return ExitCode::FAILURE;
        }
    };
    let mut fs = FileSystem::new(disk);

    print_prompt();
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();
        if command == "quit" || command == "exit" {
            break;
        }
        if !command.is_empty() {
            if let Err(err) = run_command(&mut fs, command, &args) {
                println!("{err}");
            }
        }
        print_prompt();
    }

    match save_image(&image, fs.into_inner()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("cannot save {}: {err}", image.display());
            ExitCode::FAILURE
        }
    }
}

fn run_command(fs: &mut FileSystem, command: &str, args: &[&str]) -> Result<(), ShellError> {
    match command {
        "format" => {
            fs.format()?;
            println!("disk formatted");
        }
        "mount" => {
            fs.mount()?;
            println!("disk mounted");
        }
        "unmount" => {
            fs.unmount();
            println!("disk unmounted");
        }
        "debug" => print!("{}", fs.debug()?),
        "create" => println!("created inode {}", fs.create()?),
        "delete" => {
            let inumber = parse_inumber(args, "delete <inumber>")?;
            fs.delete(inumber)?;
            println!("inode {inumber} deleted");
        }
        "getsize" => {
            let inumber = parse_inumber(args, "getsize <inumber>")?;
            println!("inode {inumber} has size {} bytes", fs.getsize(inumber)?);
        }
        "cat" => {
            let inumber = parse_inumber(args, "cat <inumber>")?;
            copy_out(fs, inumber, &mut io::stdout().lock())?;
        }
        "copyin" => {
            let &[path, inumber] = args else {
                return Err(ShellError::Usage("copyin <path> <inumber>"));
            };
            let inumber = parse_inumber(&[inumber], "copyin <path> <inumber>")?;
            let copied = copy_in(fs, Path::new(path), inumber)?;
            println!("{copied} bytes copied to inode {inumber}");
        }
        "copyout" => {
            let &[inumber, path] = args else {
                return Err(ShellError::Usage("copyout <inumber> <path>"));
            };
            let inumber = parse_inumber(&[inumber], "copyout <inumber> <path>")?;
            let mut file = File::create(path)?;
            let copied = copy_out(fs, inumber, &mut file)?;
            println!("{copied} bytes copied to {path}");
        }
        "help" => {
            println!("Available commands:");
            println!("  format");
            println!("  mount");
            println!("  unmount");
            println!("  debug");
            println!("  create");
            println!("  delete <inumber>");
            println!("  getsize <inumber>");
            println!("  cat <inumber>");
            println!("  copyin <path> <inumber>");
            println!("  copyout <inumber> <path>");
            println!("  help");
            println!("  quit");
        }
        _ => return Err(ShellError::UnknownCommand(command.to_string())),
    }
    Ok(())
}

fn parse_inumber(args: &[&str], usage: &'static str) -> Result<Inumber, ShellError> {
    match args {
        [raw] => raw.parse().map_err(|_| ShellError::Usage(usage)),
        _ => Err(ShellError::Usage(usage)),
    }
}

fn copy_in(fs: &mut FileSystem, path: &Path, inumber: Inumber) -> Result<usize, ShellError> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; BLOCK_SIZE];
    let mut offset = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let written = fs.write(inumber, offset, &buf[..n])?;
        offset += written;
        if written < n {
            println!("warning: the filesystem is full, copy truncated");
            break;
        }
    }
    Ok(offset)
}

fn copy_out(
    fs: &FileSystem,
    inumber: Inumber,
    out: &mut impl io::Write,
) -> Result<usize, ShellError> {
    let size = fs.getsize(inumber)?;
    let mut buf = [0u8; BLOCK_SIZE];
    let mut offset = 0;
    while offset < size {
        let n = fs.read(inumber, offset, &mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        offset += n;
    }
    out.flush()?;
    Ok(offset)
}

fn load_image(path: &Path, nblocks: usize) -> io::Result<Disk> {
    let mut image = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err),
    };
    image.resize(nblocks * BLOCK_SIZE, 0);
    Ok(Disk::from_vec(image).expect("image was resized to whole blocks"))
}

fn save_image(path: &Path, disk: Disk) -> io::Result<()> {
    std::fs::write(path, disk.into_vec())
}

fn print_prompt() {
    print!("minnowfs> ");
    let _ = io::stdout().flush();
}
