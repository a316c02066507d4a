use {
    c9p::{Client, MAXWELEM, P92000, Stat, Transport, dm, om, serialize::Reader, utils},
    clap::Parser,
    std::{
        io::{self, Write},
        net::TcpStream,
        os::unix::net::UnixStream,
    },
};

type Result<T> = ::std::result::Result<T, Box<dyn std::error::Error>>;

/// Print a file from a 9P server, or list a directory.
#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Path to print or list, relative to the attach root
    #[arg(default_value = "")]
    path: String,

    /// User name to attach as
    #[arg(long, default_value = "none")]
    uname: String,

    /// File tree to attach to
    #[arg(long, default_value = "")]
    aname: String,
}

/// Walk to `path`, clunking the intermediate fids a long path needs.
fn walk_path<T: Transport>(nine: &mut Client<T>, root: u32, path: &str) -> Result<u32> {
    let names: Vec<&str> = path.split('/').filter(|name| !name.is_empty()).collect();

    let (mut fid, _) = nine.walk(root, &[])?;
    for chunk in names.chunks(MAXWELEM) {
        let (next, _) = nine.walk(fid, chunk)?;
        nine.clunk(fid)?;
        fid = next;
    }
    Ok(fid)
}

fn print_file<T: Transport>(nine: &mut Client<T>, fid: u32) -> Result<()> {
    let mut buf = vec![0; nine.msize() as usize];
    let mut offset = 0u64;
    let stdout = io::stdout();
    let mut stdout = stdout.lock();

    loop {
        let n = nine.read(fid, offset, &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        stdout.write_all(&buf[..n])?;
        offset += n as u64;
    }
}

/// A directory read returns a stream of stat records; print their names.
fn list_dir<T: Transport>(nine: &mut Client<T>, fid: u32) -> Result<()> {
    let mut buf = vec![0; nine.msize() as usize];
    let mut offset = 0u64;

    loop {
        let n = nine.read(fid, offset, &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        offset += n as u64;

        let mut records = Reader::new(&buf[..n]);
        while records.remaining() > 0 {
            let stat: Stat = c9p::serialize::Decodable::decode(&mut records)?;
            println!("{}", stat.name);
        }
    }
}

fn run<T: Transport>(transport: T, cli: &Cli) -> Result<i32> {
    let mut nine = Client::new(transport);
    nine.version(8192, P92000)?;
    let (root, _) = nine.attach(&cli.uname, &cli.aname)?;

    let fid = walk_path(&mut nine, root, &cli.path)?;
    let stat = nine.stat(fid)?;
    nine.open(fid, om::READ)?;

    if stat.mode & dm::DIR != 0 {
        list_dir(&mut nine, fid)?;
    } else {
        print_file(&mut nine, fid)?;
    }

    nine.clunk(fid)?;
    nine.close()?;
    Ok(0)
}

fn npcat_main(cli: Cli) -> Result<i32> {
    let (proto, addr, port) = utils::parse_proto(&cli.address)
        .ok_or(c9p::Error::InvalidArgument("address must be proto!address!port"))?;

    match proto {
        "tcp" => run(TcpStream::connect((addr, port.parse::<u16>()?))?, &cli),
        "unix" => run(UnixStream::connect(addr)?, &cli),
        _ => Err(c9p::Error::InvalidArgument("protocol not supported").into()),
    }
}

fn main() {
    env_logger::init();

    let exit_code = npcat_main(Cli::parse()).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}
