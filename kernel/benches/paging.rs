//! Paging hot-path benchmarks: a full page sweep under memory pressure
//! and the path resolver.

use criterion::{criterion_group, criterion_main, Criterion};

use tapas_kernel::fs::Path;
use tapas_kernel::loader::ExecutableBuilder;
use tapas_kernel::transfer::UserMemory;
use tapas_kernel::vm::AddressSpace;
use tapas_kernel::{Kernel, KernelConfig};
use tapas_machine::PAGE_SIZE;

fn bench_page_sweep(c: &mut Criterion) {
    let kernel = Kernel::boot(KernelConfig::demand()).expect("kernel boot");
    ExecutableBuilder::new()
        .code(&[0xAA; 128])
        .uninit((32 * PAGE_SIZE) as u32)
        .install(&kernel.file_system, "sweep")
        .expect("install sweep image");
    let space = AddressSpace::new(&kernel, kernel.file_system.open("sweep").expect("open"), 0)
        .expect("address space");
    let um = UserMemory::new(&kernel, &space);
    let pages = space.num_pages();

    c.bench_function("page_sweep", |b| {
        b.iter(|| {
            for page in 0..pages {
                let addr = (page * PAGE_SIZE + 4) as u32;
                um.write_buffer(&[page as u8], addr).expect("sweep write");
            }
        })
    });
}

fn bench_path_merge(c: &mut Criterion) {
    c.bench_function("path_merge", |b| {
        b.iter(|| {
            let mut path = Path::new();
            path.merge("/usr/local/../share/./bin");
            path.merge("sub/dir/../../leaf");
            path.split()
        })
    });
}

criterion_group!(benches, bench_page_sweep, bench_path_merge);
criterion_main!(benches);
