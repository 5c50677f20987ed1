use clap::Parser as ClapParser;
use std::{path::PathBuf, process, sync::Arc, thread, time::Instant};

use hoist::{
    ClassAttrs, ClassDecl, DeclContext, DirBlobStore, FuncAttrs, IncludeKind, Runtime,
    RuntimeCreateInfo, Unit, UnitEmitter, UnitRegistry, Value,
};
use log::{error, info};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Worker threads, each running its own activations
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Activations per thread
    #[arg(long, default_value_t = 1000)]
    activations: usize,

    /// Directory used as the persistent unit cache
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Print every unit's disassembly and merge sequence, then exit
    #[arg(long)]
    dump: bool,

    /// Whole-program mode: enables the unique-name fast paths
    #[arg(long)]
    authoritative: bool,
}

const DOC_ROOT: &str = "/app";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let registry = Arc::new(UnitRegistry::new(DOC_ROOT));
    let mut info = RuntimeCreateInfo::default().with_loader(registry.clone());
    info.authoritative = cli.authoritative;
    if let Some(root) = &cli.repo {
        info = info.with_blob_store(Arc::new(DirBlobStore::new(root)));
    }
    let rt = Runtime::new(info);

    let mut units = Vec::new();
    for emitter in demo_program(&rt) {
        units.push(registry.register(compile_or_load(&rt, emitter)));
    }

    if cli.dump {
        for unit in &units {
            println!("{unit}");
        }
        return;
    }

    let Some(entry) = registry.get(&format!("{DOC_ROOT}/index.php")) else {
        error!("entry point missing");
        process::exit(1);
    };

    let start = Instant::now();
    let workers: Vec<_> = (0..cli.threads)
        .map(|_| {
            let rt = rt.clone();
            let entry = entry.clone();
            let activations = cli.activations;
            thread::spawn(move || {
                let mut failures = 0usize;
                for _ in 0..activations {
                    let mut act = rt.activate();
                    match act.include(&entry) {
                        Ok(_) if act.lookup_class("HomeController").is_some() => {}
                        Ok(_) => failures += 1,
                        Err(err) => {
                            error!("{err}");
                            failures += 1;
                        }
                    }
                }
                failures
            })
        })
        .collect();

    let mut failures = 0;
    for worker in workers {
        match worker.join() {
            Ok(n) => failures += n,
            Err(_) => failures += cli.activations,
        }
    }
    let total = cli.threads * cli.activations;
    let elapsed = start.elapsed();
    info!(
        "{total} activations in {elapsed:?} ({:.0}/s), {failures} failed, {} names, {} reclaimed",
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        rt.directory().len(),
        rt.reclaim()
    );
    for unit in &units {
        info!("{}: {:?}", unit.path(), unit.merge_state());
    }
    if failures > 0 {
        process::exit(1);
    }
}

/// Use the cached copy of a unit when the repo has one, else commit it.
fn compile_or_load(rt: &Runtime, emitter: UnitEmitter) -> Unit {
    let unit = emitter.finish();
    if let Some(cached) = rt.load(unit.path(), &unit.digest()) {
        info!("{} loaded from repo ({})", unit.path(), unit.digest().short());
        if let Some(cached) = Arc::into_inner(cached) {
            return cached;
        }
    }
    if let Err(err) = rt.commit(&unit) {
        error!("{}: commit failed: {err}", unit.path());
    }
    unit
}

/// A small program: a merge-only library, a merge-only entry point that
/// includes it, and a bootstrap script with conditional declarations.
fn demo_program(rt: &Runtime) -> Vec<UnitEmitter> {
    let unique = if rt.is_authoritative() {
        ClassAttrs::UNIQUE
    } else {
        ClassAttrs::empty()
    };

    let mut lib = rt.new_emitter(&format!("{DOC_ROOT}/lib/base.php"));
    lib.new_class_template(
        ClassDecl::new("Renderable")
            .attrs(ClassAttrs::INTERFACE | unique)
            .method("render"),
        DeclContext::TopLevel,
    );
    lib.new_class_template(
        ClassDecl::new("Controller")
            .implements("Renderable")
            .attrs(ClassAttrs::ABSTRACT | unique)
            .method("render")
            .line(5),
        DeclContext::TopLevel,
    );
    let one = lib.add_constant(Value::Int(1)) as u16;
    lib.bytecode().ret_c(one);
    lib.set_main_return(Value::Int(1));

    let mut boot = rt.new_emitter(&format!("{DOC_ROOT}/bootstrap.php"));
    let debug = boot.add_literal("DEBUG") as u16;
    let hits = boot.add_literal("hits") as u16;
    let zero = boot.add_constant(Value::Int(0)) as u16;
    let tracer = boot.new_class_template(
        ClassDecl::new("Tracer").attrs(unique).line(3),
        DeclContext::Conditional,
    ) as u16;
    let skip = boot.bytecode().jump_if_undefined(debug);
    boot.bytecode().def_cls(tracer);
    boot.bytecode().bind(skip);
    boot.bytecode().set_global(hits, zero);

    // Without whole-program mode the entry point cannot be merge-only, so
    // its bytecode repeats every mergeable statement.
    let mut index = rt.new_emitter(&format!("{DOC_ROOT}/index.php"));
    let lib_path = index.add_literal("lib/base.php") as u16;
    let boot_path = index.add_literal("bootstrap.php") as u16;
    let version = index.add_literal("APP_VERSION") as u16;
    let version_value = index.add_constant(Value::str("1.0")) as u16;
    let null = index.add_constant(Value::Null) as u16;
    index.push_mergeable_include(IncludeKind::Relative, "lib/base.php");
    index.bytecode().incl(IncludeKind::Relative, lib_path);
    index.push_mergeable_define("APP_VERSION", Value::str("1.0"));
    index.bytecode().def_cns(version, version_value);
    index.push_mergeable_include(IncludeKind::DocRoot, "bootstrap.php");
    index.bytecode().incl(IncludeKind::DocRoot, boot_path);
    let home = index.new_class_template(
        ClassDecl::new("HomeController")
            .extends("Controller")
            .attrs(ClassAttrs::FINAL | unique)
            .method("index")
            .line(9),
        DeclContext::TopLevel,
    ) as u16;
    index.bytecode().def_cls(home);
    index.bytecode().ret_c(null);
    index.set_main_return(Value::Null);
    index.new_function("main", FuncAttrs::TOP | FuncAttrs::UNIQUE, 12);
    index.bytecode().ret_c(null);

    vec![lib, boot, index]
}
