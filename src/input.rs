use crate::config::{Config, InputConfig};
use crate::dist::IntegerDistribution;
use anyhow::{Context, Result, bail};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Immutable per-unit data shared by every scenario.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitTemplate {
    /// Historical batch sizes of moves leaving the unit.
    pub off_movement: IntegerDistribution,
    /// Units of the other kind in contact with this one.
    pub connections: Vec<String>,
}

/// Empirical departure/destination pairs, sampled uniformly with replacement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MovementTable {
    pub pairs: Vec<(String, String)>,
    /// Animals moved over the whole movement window.
    pub total_animals: u64,
}

/// Static description of farms, reservoirs and their data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Landscape {
    pub farms: BTreeMap<String, UnitTemplate>,
    pub reservoirs: BTreeMap<String, UnitTemplate>,
    pub cattle_movements: MovementTable,
    pub badger_movements: MovementTable,
    pub herd_sizes: IntegerDistribution,
    pub reservoir_sizes: IntegerDistribution,
    /// Slaughter dates mapped to farm ids, one id per animal.
    pub slaughter: BTreeMap<i32, Vec<String>>,
    pub cattle_sampling: BTreeMap<i32, f64>,
    pub badger_sampling: BTreeMap<i32, f64>,
    pub observed_distances: IntegerDistribution,
}

impl Landscape {
    pub fn load<P: AsRef<Path>>(sim_dir: P, cfg: &Config) -> Result<Self> {
        let sim_dir = sim_dir.as_ref();
        let inputs: &InputConfig = &cfg.inputs;
        let read = |file: &PathBuf| -> Result<String> {
            let file = sim_dir.join(file);
            fs::read_to_string(&file).with_context(|| format!("failed to open {file:?}"))
        };

        let mut landscape = Landscape::default();
        for id in parse_ids(&read(&inputs.farms)?).context("failed to parse farms")? {
            landscape.farms.insert(id, UnitTemplate::default());
        }
        for id in parse_ids(&read(&inputs.reservoirs)?).context("failed to parse reservoirs")? {
            landscape.reservoirs.insert(id, UnitTemplate::default());
        }

        let locations = parse_locations(&read(&inputs.reservoir_locations)?)
            .context("failed to parse reservoir locations")?;
        landscape
            .connect(locations)
            .context("failed to connect reservoirs to farms")?;

        let moves = parse_movements(&read(&inputs.cattle_movements)?)
            .context("failed to parse cattle movements")?;
        landscape.cattle_movements = build_movements(&mut landscape.farms, moves)
            .context("failed to build cattle movements")?;
        let moves = parse_movements(&read(&inputs.badger_movements)?)
            .context("failed to parse badger movements")?;
        landscape.badger_movements = build_movements(&mut landscape.reservoirs, moves)
            .context("failed to build badger movements")?;

        landscape.herd_sizes = parse_distribution(&read(&inputs.herd_sizes)?)
            .context("failed to parse herd sizes")?;
        landscape.reservoir_sizes = parse_distribution(&read(&inputs.reservoir_sizes)?)
            .context("failed to parse reservoir sizes")?;
        landscape.observed_distances = parse_distribution(&read(&inputs.observed_distances)?)
            .context("failed to parse observed distances")?;

        landscape.slaughter = parse_schedule(
            &read(&inputs.slaughter_schedule)?,
            cfg.simulation.start_date,
            cfg.simulation.end_date,
        )
        .context("failed to parse slaughter schedule")?;
        for ids in landscape.slaughter.values() {
            if let Some(id) = ids.iter().find(|id| !landscape.farms.contains_key(*id)) {
                bail!("slaughter schedule names unknown farm {id}");
            }
        }

        landscape.cattle_sampling = parse_rates(&read(&inputs.cattle_sampling_rates)?)
            .context("failed to parse cattle sampling rates")?;
        landscape.badger_sampling = parse_rates(&read(&inputs.badger_sampling_rates)?)
            .context("failed to parse badger sampling rates")?;

        log::info!(
            "loaded {} farms, {} reservoirs, {} cattle and {} badger movement pairs",
            landscape.farms.len(),
            landscape.reservoirs.len(),
            landscape.cattle_movements.pairs.len(),
            landscape.badger_movements.pairs.len()
        );

        Ok(landscape)
    }

    fn connect(&mut self, locations: Vec<(String, Vec<String>)>) -> Result<()> {
        for (reservoir_id, farm_ids) in locations {
            let reservoir = self
                .reservoirs
                .get_mut(&reservoir_id)
                .with_context(|| format!("unknown reservoir {reservoir_id}"))?;
            reservoir.connections.extend(farm_ids.iter().cloned());
            for farm_id in farm_ids {
                let farm = self
                    .farms
                    .get_mut(&farm_id)
                    .with_context(|| format!("unknown farm {farm_id}"))?;
                farm.connections.push(reservoir_id.clone());
            }
        }
        Ok(())
    }
}

fn content_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// First comma-separated column of every line.
pub fn parse_ids(text: &str) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for line in content_lines(text) {
        let id = line.split(',').next().map(str::trim).unwrap_or_default();
        if id.is_empty() {
            bail!("line {line:?} has no id");
        }
        ids.push(id.to_string());
    }
    Ok(ids)
}

/// Lines of the form `DEP-DEST n1,n2,...`.
pub fn parse_movements(text: &str) -> Result<Vec<(String, String, Vec<u32>)>> {
    let mut moves = Vec::new();
    for line in content_lines(text) {
        let (units, batches) = line
            .split_once(char::is_whitespace)
            .with_context(|| format!("movement line {line:?} has no batch sizes"))?;
        let (departure, destination) = units
            .split_once('-')
            .with_context(|| format!("movement line {line:?} has no destination"))?;
        let batches = batches
            .split(',')
            .map(|n| n.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("failed to parse batch sizes of {line:?}"))?;
        moves.push((departure.to_string(), destination.to_string(), batches));
    }
    Ok(moves)
}

fn build_movements(
    units: &mut BTreeMap<String, UnitTemplate>,
    moves: Vec<(String, String, Vec<u32>)>,
) -> Result<MovementTable> {
    let mut table = MovementTable::default();
    for (departure, destination, batches) in moves {
        if departure == destination {
            continue;
        }
        if !units.contains_key(&destination) {
            bail!("unknown destination {destination}");
        }
        let unit = units
            .get_mut(&departure)
            .with_context(|| format!("unknown departure {departure}"))?;
        for &batch in &batches {
            unit.off_movement.add_count(batch, 1);
            table.total_animals += batch as u64;
        }
        table.pairs.push((departure, destination));
    }
    Ok(table)
}

/// Lines of the form `x:frequency`.
pub fn parse_distribution(text: &str) -> Result<IntegerDistribution> {
    let mut dist = IntegerDistribution::new();
    for line in content_lines(text) {
        let (bin, freq) = line
            .split_once(':')
            .with_context(|| format!("distribution line {line:?} has no ':'"))?;
        let bin: u32 = bin
            .trim()
            .parse()
            .with_context(|| format!("failed to parse bin of {line:?}"))?;
        let freq: u64 = freq
            .trim()
            .parse()
            .with_context(|| format!("failed to parse frequency of {line:?}"))?;
        dist.add_count(bin, freq);
    }
    Ok(dist)
}

/// Lines of the form `date:farm,farm,...`, restricted to `[start, end]`.
pub fn parse_schedule(text: &str, start: i32, end: i32) -> Result<BTreeMap<i32, Vec<String>>> {
    let mut schedule: BTreeMap<i32, Vec<String>> = BTreeMap::new();
    for line in content_lines(text) {
        let (date, ids) = line
            .split_once(':')
            .with_context(|| format!("schedule line {line:?} has no ':'"))?;
        let date: i32 = date
            .trim()
            .parse()
            .with_context(|| format!("failed to parse date of {line:?}"))?;
        if date < start || date > end {
            continue;
        }
        schedule
            .entry(date)
            .or_default()
            .extend(ids.split(',').map(str::trim).filter(|id| !id.is_empty()).map(String::from));
    }
    Ok(schedule)
}

/// Lines of the form `year,rate`.
pub fn parse_rates(text: &str) -> Result<BTreeMap<i32, f64>> {
    let mut rates = BTreeMap::new();
    for line in content_lines(text) {
        let (year, rate) = line
            .split_once(',')
            .with_context(|| format!("rate line {line:?} has no ','"))?;
        let year: i32 = year
            .trim()
            .parse()
            .with_context(|| format!("failed to parse year of {line:?}"))?;
        let rate: f64 = rate
            .trim()
            .parse()
            .with_context(|| format!("failed to parse rate of {line:?}"))?;
        if !(0.0..=1.0).contains(&rate) {
            bail!("sampling rate {rate} of year {year} is not a probability");
        }
        rates.insert(year, rate);
    }
    Ok(rates)
}

/// Lines of the form `RESERVOIR:farm,farm,...`.
pub fn parse_locations(text: &str) -> Result<Vec<(String, Vec<String>)>> {
    let mut locations = Vec::new();
    for line in content_lines(text) {
        let (reservoir, farms) = line
            .split_once(':')
            .with_context(|| format!("location line {line:?} has no ':'"))?;
        let farms = farms
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();
        locations.push((reservoir.trim().to_string(), farms));
    }
    Ok(locations)
}
