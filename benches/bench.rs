#![cfg_attr(feature = "nightly", feature(allocator_api))]

use allocator_api2::{
    alloc::{AllocError, Allocator, Global, Layout},
    vec::Vec,
};

use core::ptr::NonNull;

use criterion::*;
use wheel_alloc::WheelAlloc;

#[repr(transparent)]
struct Bump<'a> {
    bump: &'a mut bumpalo::Bump,
}

impl Bump<'_> {
    #[inline(always)]
    fn reset(&mut self) {
        self.bump.reset();
    }
}

unsafe impl<'a> Allocator for Bump<'a> {
    #[inline(always)]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        Allocator::allocate(&&*self.bump, layout)
    }

    #[inline(always)]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        Allocator::deallocate(&&*self.bump, ptr, layout)
    }
}

#[repr(transparent)]
struct BlinkAlloc<'a> {
    blink: &'a mut blink_alloc::BlinkAlloc,
}

impl BlinkAlloc<'_> {
    #[inline(always)]
    fn reset(&mut self) {
        self.blink.reset();
    }
}

unsafe impl<'a> Allocator for BlinkAlloc<'a> {
    #[inline(always)]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        Allocator::allocate(&&*self.blink, layout)
    }

    #[inline(always)]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        Allocator::deallocate(&&*self.blink, ptr, layout)
    }
}

const WARM_UP_SIZE: usize = 65535;
const CHURN_SIZE: usize = 16384;
const VEC_SIZES: [usize; 4] = [10, 146, 2134, 17453];

/// The pool's home turf: many small allocations, one bulk release.
fn bench_warm_up<A>(name: &str, c: &mut Criterion, mut alloc: A, mut reset: impl FnMut(&mut A))
where
    A: Allocator,
{
    let mut group = c.benchmark_group(format!("warm-up/{name}"));

    group.bench_function(format!("alloc 4 bytes x {WARM_UP_SIZE}"), |b| {
        b.iter(|| {
            for _ in 0..WARM_UP_SIZE {
                black_box(alloc.allocate(Layout::new::<u32>()).unwrap());
            }
            reset(&mut alloc);
        })
    });

    group.finish();
}

/// Paired alloc/free traffic keeps the recycler busy.
fn bench_churn<A>(name: &str, c: &mut Criterion, alloc: A)
where
    A: Allocator,
{
    let mut group = c.benchmark_group(format!("churn/{name}"));

    group.bench_function(format!("alloc-free x {CHURN_SIZE}"), |b| {
        b.iter(|| {
            for _ in 0..CHURN_SIZE {
                let ptr = black_box(alloc.allocate(Layout::new::<[u8; 48]>()).unwrap());
                unsafe {
                    alloc.deallocate(ptr.cast(), Layout::new::<[u8; 48]>());
                }
            }
        })
    });

    group.bench_function(format!("grow x {CHURN_SIZE}"), |b| {
        b.iter(|| {
            for _ in 0..CHURN_SIZE {
                unsafe {
                    let ptr = alloc.allocate(Layout::new::<u32>()).unwrap();
                    let ptr = alloc
                        .grow(ptr.cast(), Layout::new::<u32>(), Layout::new::<[u32; 16]>())
                        .unwrap();
                    let ptr = black_box(ptr);
                    alloc.deallocate(ptr.cast(), Layout::new::<[u32; 16]>());
                }
            }
        })
    });

    group.finish();
}

fn bench_vec<A>(name: &str, c: &mut Criterion, mut alloc: A, reset: impl Fn(&mut A))
where
    A: Allocator,
{
    let mut group = c.benchmark_group(format!("vec/{name}"));

    for size in VEC_SIZES {
        group.bench_function(format!("push x {size}"), |b| {
            b.iter(|| {
                let mut vec = Vec::new_in(&alloc);
                for i in 0..size {
                    vec.push(i);
                }
                drop(vec);
                reset(&mut alloc);
            })
        });

        group.bench_function(format!("reserve_exact(1) x {size}"), |b| {
            b.iter(|| {
                let mut vec = Vec::<u32, _>::new_in(&alloc);
                for i in 0..size {
                    vec.reserve_exact(i);
                }
                drop(vec);
                reset(&mut alloc);
            })
        });
    }

    group.finish();
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let wheel = WheelAlloc::new();
    let mut bump = bumpalo::Bump::new();
    let mut blink = blink_alloc::BlinkAlloc::new();

    bench_warm_up("Global", c, Global, |_| {});

    bench_warm_up("wheel_alloc::WheelAlloc", c, wheel.clone(), |wa| unsafe {
        wa.reset();
    });

    bench_warm_up("bumpalo::Bump", c, Bump { bump: &mut bump }, |bump| {
        *bump.bump = bumpalo::Bump::new()
    });

    bench_warm_up(
        "blink_alloc::BlinkAlloc",
        c,
        BlinkAlloc { blink: &mut blink },
        |blink| *blink.blink = blink_alloc::BlinkAlloc::new(),
    );

    bench_churn("Global", c, Global);
    bench_churn("wheel_alloc::WheelAlloc", c, wheel.clone());

    bench_vec("Global", c, Global, |_| {});
    bench_vec("wheel_alloc::WheelAlloc", c, wheel.clone(), |wa| unsafe {
        wa.reset();
    });
    bench_vec("bumpalo::Bump", c, Bump { bump: &mut bump }, |b| b.reset());
    bench_vec(
        "blink_alloc::BlinkAlloc",
        c,
        BlinkAlloc { blink: &mut blink },
        |b| b.reset(),
    );
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
