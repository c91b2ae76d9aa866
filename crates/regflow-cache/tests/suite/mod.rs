mod eviction;
mod semantic;
