//! Reads an IFPS container from the path given as the first argument and
//! prints its disassembly to stdout.

use std::{env, fs, process};

fn read_file(path: &str) -> std::io::Result<Vec<u8>> {
	#[cfg(feature = "mmap")]
	{
		let file = fs::File::open(path)?;
		let map = unsafe { memmap2::Mmap::map(&file)? };
		Ok(map.to_vec())
	}
	#[cfg(not(feature = "mmap"))]
	{
		fs::read(path)
	}
}

fn main() {
	#[cfg(feature = "tracing")]
	tracing_subscriber_init();

	let mut args = env::args().skip(1);
	let Some(path) = args.next() else {
		eprintln!("usage: ifps-disasm <file.ifps>");
		process::exit(2);
	};

	let data = match read_file(&path) {
		Ok(data) => data,
		Err(err) => {
			eprintln!("{path}: {err}");
			process::exit(1);
		},
	};

	let unit = match ifps::parse(&data) {
		Ok(unit) => unit,
		Err(err) => {
			eprintln!("{path}: {err}");
			process::exit(1);
		},
	};

	match ifps::disasm::disassemble(&unit) {
		Ok(text) => print!("{text}"),
		Err(err) => {
			eprintln!("{path}: {err}");
			process::exit(1);
		},
	}
}

#[cfg(feature = "tracing")]
fn tracing_subscriber_init() {
	use tracing::Level;
	let _ = tracing::subscriber::set_global_default(
		tracing_subscriber::fmt().with_max_level(Level::INFO).finish(),
	);
}
