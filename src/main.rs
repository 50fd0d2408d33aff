#![allow(mixed_script_confusables)]

use std::env;
use std::error::Error;
use std::rc::Rc;

use log::info;
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand_distr::StandardNormal;

use crate::core::distance::{DistanceLayer, DistanceLayerConfiguration};
use crate::core::operations::{Operation, SquaredError};
use crate::core::optimization::{Optimizer, StochasticGradientDescentOptimizer};
use crate::core::radial_basis::SlidingRadialBasisLayer;
use crate::core::{backprop, Parameterized, TensorBuilder};

mod core;

const INSTRUCTIONS: &str =
    "pass `--geometry W H D FW FH FC SX SY` to inspect a distance layer, or `--demo` to fit one";

fn parse_geometry(args: &[String]) -> Result<DistanceLayerConfiguration, Box<dyn Error>> {
    if args.len() != 8 {
        return Err(format!("expected 8 integers, got {}", args.len()).into());
    }
    let values = args
        .iter()
        .map(|arg| arg.parse::<usize>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DistanceLayerConfiguration {
        input_width: values[0],
        input_height: values[1],
        input_depth: values[2],
        filter_width: values[3],
        filter_height: values[4],
        filter_count: values[5],
        stride_x: values[6],
        stride_y: values[7],
    })
}

fn inspect(configuration: DistanceLayerConfiguration) -> Result<(), Box<dyn Error>> {
    let layer = DistanceLayer::new("inspected", configuration)?;
    println!(
        "output: {}×{}×{} ({} windows of {} values each)",
        layer.output_width(),
        layer.output_height(),
        layer.output_depth(),
        layer.geometry().window_count(),
        layer.geometry().window_size()
    );
    let filters = layer.filters();
    println!(
        "parameter count: {} ({} shaped {:?})",
        layer.parameter_count(),
        filters.identifier(),
        filters.borrow_array().shape()
    );

    let input = Rc::new(
        TensorBuilder::new(
            Array::random(
                (
                    1,
                    configuration.input_height,
                    configuration.input_width,
                    configuration.input_depth,
                ),
                StandardNormal,
            )
            .into_dyn(),
        )
        .requires_gradient(false)
        .build(),
    );
    let distances = layer.forward(input)?;
    let distances = distances.borrow_array();
    println!(
        "distances for a random input: shape {:?}, mean {:.3}",
        distances.shape(),
        distances.mean().unwrap_or(0.)
    );
    Ok(())
}

fn demo() -> Result<(), Box<dyn Error>> {
    let configuration = DistanceLayerConfiguration {
        input_width: 6,
        input_height: 6,
        input_depth: 1,
        filter_width: 3,
        filter_height: 3,
        filter_count: 4,
        stride_x: 1,
        stride_y: 1,
    };
    let layer = SlidingRadialBasisLayer::new("demo", configuration)?;
    let distance_layer = layer.distance_layer();
    info!(
        "fitting {} filters of {} values, radial-basis normalizer {}",
        distance_layer.output_depth(),
        distance_layer.configuration().filter_size(),
        layer.radial_basis().normalizer()
    );
    let input = Rc::new(
        TensorBuilder::new(
            Array::random((4, 6, 6, 1), StandardNormal)
                .mapv(|x: f32| x * 0.5)
                .into_dyn(),
        )
        .identifier("demo_input")
        .requires_gradient(false)
        .build(),
    );
    // every window should respond strongly to some filter: ask for 0.5 everywhere
    let target = Rc::new(
        TensorBuilder::new(
            Array::from_elem(
                (
                    4,
                    distance_layer.output_width() * distance_layer.output_height(),
                    distance_layer.output_depth(),
                ),
                0.5,
            )
            .into_dyn(),
        )
        .identifier("demo_target")
        .requires_gradient(false)
        .build(),
    );

    let mut optimizer = StochasticGradientDescentOptimizer::new(layer.parameters(), 0.01);
    for _ in 0..100 {
        let output = layer.forward(input.clone())?;
        let loss = SquaredError {}.forward(vec![output, target.clone()])?;
        let loss_value = loss.item().unwrap_or(f32::NAN);
        let gradients = backprop(loss)?;
        optimizer.step(&gradients);
        if optimizer.step_count() % 10 == 0 {
            info!("after {} steps, loss: {}", optimizer.step_count(), loss_value);
        }
    }
    info!(
        "learned radial-basis scalers: {}",
        layer.radial_basis().scalers().borrow_array()
    );
    println!("demo finished after {} steps", optimizer.step_count());
    Ok(())
}

fn main() {
    env_logger::init();
    let args = env::args().collect::<Vec<_>>();

    if args.len() <= 1 {
        println!("{}", INSTRUCTIONS);
        return;
    }

    let outcome = match args[1].as_str() {
        "--geometry" => parse_geometry(&args[2..]).and_then(inspect),
        "--demo" => demo(),
        _ => {
            println!("{}", INSTRUCTIONS);
            Ok(())
        }
    };
    if let Err(error) = outcome {
        eprintln!("error: {}", error);
        std::process::exit(1);
    }
}
