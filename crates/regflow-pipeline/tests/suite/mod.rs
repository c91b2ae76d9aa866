mod coordinator;
mod embedding;
mod stages;
