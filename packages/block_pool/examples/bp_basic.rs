//! Basic usage of `BlockPool` as backing storage for values with stable addresses.

use std::num::NonZero;

use block_pool::BlockPool;

#[derive(Debug)]
struct Point {
    x: f32,
    y: f32,
}

fn main() {
    let mut pool = BlockPool::builder()
        .block_layout_of::<Point>()
        .growth(NonZero::new(16).unwrap())
        .build()
        .unwrap();

    let mut points = Vec::new();

    for i in 0..20_u16 {
        let block = pool.allocate().unwrap().cast::<Point>();

        // SAFETY: The block is sized and aligned for a Point and nobody else uses it.
        unsafe {
            block.write(Point {
                x: f32::from(i),
                y: f32::from(i) * 2.0,
            });
        }

        points.push(block);
    }

    println!(
        "{} blocks in use across {} chunks (capacity {})",
        pool.len(),
        pool.chunk_count(),
        pool.capacity()
    );

    // SAFETY: The block holds an initialized Point.
    println!("first point: {:?}", unsafe { points[0].as_ref() });

    for block in points {
        // SAFETY: The block holds an initialized Point that we drop exactly once, after which we
        // hand the block back to the pool it came from.
        unsafe {
            block.drop_in_place();
            pool.release(block.cast());
        }
    }

    println!("after release: {} in use, {} vacant", pool.len(), pool.vacant());
}
