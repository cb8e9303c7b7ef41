//! `netstackd`: brings up a [`netstack::Stack`] over real NICs via
//! `netstack-pcap` and drives it from an interactive command shell, the
//! live counterpart of the library's test harnesses (grounded on the
//! historical project's disused `testTinyShell`).

use std::io::{self, BufRead, Write as _};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use netstack::config::StackConfig;
use netstack::device::DeviceId;
use netstack::ether::MacAddr;
use netstack::route::{mask_for_prefix_len, Metric, RouteEntry};
use netstack::socket::{AddressFamily, Protocol, SocketType};
use netstack::Stack;
use netstack_pcap::PnetBackend;

/// A static route to seed before bringing the stack up, `prefix/len:via_ip`.
#[derive(Debug, Clone)]
struct StaticRoute {
    prefix: Ipv4Addr,
    len: u32,
    dev: String,
}

impl std::str::FromStr for StaticRoute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cidr, dev) = s.split_once(':').ok_or("expected prefix/len:device")?;
        let (prefix, len) = cidr.split_once('/').ok_or("expected prefix/len")?;
        Ok(Self {
            prefix: prefix.parse().map_err(|e| format!("{e}"))?,
            len: len.parse().map_err(|e| format!("{e}"))?,
            dev: dev.to_string(),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "netstackd", about = "Userspace TCP/IP stack with SDP routing")]
struct Args {
    /// Network interface to bind (repeatable). At least one is required.
    #[arg(short, long = "if", required = true)]
    interfaces: Vec<String>,

    /// Print every captured frame on its device, in addition to handling it.
    #[arg(long)]
    sniff: bool,

    /// Additional static route: `prefix/len:device`, e.g. `0.0.0.0/0:eth0`.
    #[arg(short = 'r', long = "route")]
    routes: Vec<StaticRoute>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let stack = Stack::new(StackConfig::default());
    let backend = PnetBackend::new();

    let mut device_ids: Vec<(String, DeviceId)> = Vec::new();
    for name in &args.interfaces {
        match stack.add_device(name, args.sniff, &backend) {
            Ok(id) => {
                info!("bound interface {name} as device {id}");
                device_ids.push((name.clone(), id));
            }
            Err(e) => {
                error!("failed to bind interface {name}: {e}");
                std::process::exit(1);
            }
        }
    }

    for route in &args.routes {
        let Some((_, dev)) = device_ids.iter().find(|(n, _)| n == &route.dev) else {
            error!("route via unknown device {}", route.dev);
            std::process::exit(1);
        };
        stack.routes.set_item(RouteEntry {
            prefix: route.prefix,
            mask: mask_for_prefix_len(route.len),
            dev: *dev,
            next_hop: MacAddr::BROADCAST,
            dist: 1,
            is_local: false,
            metric: Metric::NoDel,
        });
        info!("static route {}/{} via device {}", route.prefix, route.len, dev);
    }

    stack.bring_up();
    run_shell(&stack);
    stack.shutdown();
}

fn run_shell(stack: &Arc<Stack>) {
    println!("netstackd ready. Type \"help\" for commands.");
    let stdin = io::stdin();
    let mut active_fd: Option<i32> = None;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        print!("> ");
        io::stdout().flush().ok();
        if line.is_empty() {
            continue;
        }
        let mut words = line.split_whitespace();
        let cmd = words.next().unwrap_or("");
        let rest: Vec<&str> = words.collect();

        match cmd {
            "help" | "h" => print_help(),
            "routes" => {
                for e in stack.routes.snapshot() {
                    println!("{}/{} via dev {} dist {} {:?}", e.prefix, e.prefix_len(), e.dev, e.dist, e.metric);
                }
            }
            "devices" => {
                for d in stack.devices.devices() {
                    println!("{}: {} mac={} ip={}", d.id, d.name, d.mac, d.ipv4);
                }
            }
            "socket" => match stack.sockets.socket(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp) {
                Ok(fd) => {
                    active_fd = Some(fd);
                    println!("fd {fd}");
                }
                Err(e) => println!("error: {e}"),
            },
            "bind" => with_addr(&rest, |addr| match active_fd.and_then(|fd| stack.sockets.bind(fd, addr).ok()) {
                Some(()) => println!("ok"),
                None => println!("error"),
            }),
            "listen" => match active_fd {
                Some(fd) => match stack.sockets.listen(fd, 0) {
                    Ok(()) => println!("listening"),
                    Err(e) => println!("error: {e}"),
                },
                None => println!("no active socket"),
            },
            "accept" => match active_fd {
                Some(fd) => match stack.sockets.accept(fd) {
                    Ok(new_fd) => {
                        active_fd = Some(new_fd);
                        println!("accepted fd {new_fd}");
                    }
                    Err(e) => println!("error: {e}"),
                },
                None => println!("no active socket"),
            },
            "connect" => with_addr(&rest, |addr| match active_fd {
                Some(fd) => match stack.sockets.connect(fd, addr) {
                    Ok(()) => println!("connected"),
                    Err(e) => println!("error: {e}"),
                },
                None => println!("no active socket"),
            }),
            "send" => {
                let text = rest.join(" ");
                match active_fd {
                    Some(fd) => match stack.sockets.write(fd, text.as_bytes()) {
                        Ok(n) => println!("sent {n} bytes"),
                        Err(e) => println!("error: {e}"),
                    },
                    None => println!("no active socket"),
                }
            }
            "recv" => match active_fd {
                Some(fd) => match stack.sockets.read(fd, 4096) {
                    Ok(data) => println!("{}", String::from_utf8_lossy(&data)),
                    Err(e) => println!("error: {e}"),
                },
                None => println!("no active socket"),
            },
            "close" => match active_fd.take() {
                Some(fd) => match stack.sockets.close(fd) {
                    Ok(()) => println!("closed"),
                    Err(e) => println!("error: {e}"),
                },
                None => println!("no active socket"),
            },
            "fd" => println!("{:?}", active_fd),
            "exit" | "q" | "quit" => break,
            other => println!("unknown command: {other} (try \"help\")"),
        }
    }
}

fn with_addr(rest: &[&str], f: impl FnOnce(SocketAddrV4)) {
    match rest.first().and_then(|s| s.parse::<SocketAddrV4>().ok()) {
        Some(addr) => f(addr),
        None => println!("usage: <cmd> ip:port"),
    }
}

fn print_help() {
    println!(
        "  help              show this page\n\
         routes            print the routing table\n\
         devices           print bound devices\n\
         socket            open a new TCP socket, make it active\n\
         bind ip:port      bind the active socket\n\
         listen            listen on the active socket\n\
         accept            accept a connection, make the child active\n\
         connect ip:port   connect the active socket\n\
         send <text>       write text on the active socket\n\
         recv              read from the active socket\n\
         close             close the active socket\n\
         fd                show the active file descriptor\n\
         quit              exit"
    );
}
