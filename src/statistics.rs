//! # Statistics
//!
//! Plots describing a computed disparity map, only available with the `statistics` feature.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::Path;

use plotters::prelude::*;

use crate::disparity::{DisparityMap, DISP_SHIFT};
use crate::error::*;

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Number of valid pixels at each whole pixel disparity.
pub fn disparity_histogram(map: &DisparityMap) -> Vec<(i32, u32)> {
    let min_d = map.min_disparity();
    let mut counts = vec![0u32; map.num_disparities().max(0) as usize + 1];
    let invalid = map.invalid_value();

    for v in map.as_image().iter() {
        if *v <= invalid {
            continue;
        }

        let bin = ((*v as i32) >> DISP_SHIFT) - min_d;
        if bin >= 0 && (bin as usize) < counts.len() {
            counts[bin as usize] += 1;
        }
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, c)| (min_d + i as i32, c))
        .collect()
}

/// Draw the disparity histogram of a map to a PNG file.
pub fn plot_disparity_histogram<P: AsRef<Path>>(map: &DisparityMap, path: P) -> Result<()> {
    let histogram = disparity_histogram(map);
    let max_count = histogram.iter().map(|(_, c)| *c).max().unwrap_or(0).max(1);
    let min_d = map.min_disparity();
    let max_d = min_d + map.num_disparities();

    let root = BitMapBackend::new(path.as_ref(), (800, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Disparity histogram", ("sans-serif", 20).into_font())
        .margin(5)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_ranged(min_d..max_d, 0..max_count)
        .map_err(plot_err)?;

    chart.configure_mesh().draw().map_err(plot_err)?;

    chart
        .draw_series(LineSeries::new(histogram, &RED))
        .map_err(plot_err)?
        .label("Valid pixels")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(plot_err)?;

    Ok(())
}

fn plot_err<E: std::fmt::Debug>(e: E) -> Error {
    Error::Statistics(format!("{:?}", e))
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_counts_valid_pixels() {
        let mut map = DisparityMap::new(4, 2, 0, 16);
        map.put(0, 0, 3 * 16);
        map.put(1, 0, 3 * 16 + 9);
        map.put(2, 0, 10 * 16);

        let hist = disparity_histogram(&map);

        assert_eq!(hist[3], (3, 2));
        assert_eq!(hist[10], (10, 1));
        assert_eq!(hist.iter().map(|(_, c)| c).sum::<u32>(), 3);
    }
}
