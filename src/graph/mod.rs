pub mod exposure_graph;
