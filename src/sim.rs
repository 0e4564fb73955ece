//! Simulated drivers.
//!
//! These components behave like simple hardware (a stage that takes time to move, a
//! sensor whose acquisition lasts its exposure time) without touching any device. The
//! daemon builds them from the `[[components]]` table of the configuration through a
//! [`DriverRegistry`], one factory per driver type.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::action::{Action, ActionContext};
use crate::attribute::{Attribute, AttributeValue};
use crate::component::{Component, LocalComponent};
use crate::composite::CompositeComponent;
use crate::config::DaqModelConfig;
use crate::error::{DaqError, DaqResult};
use crate::executor::{ExecutorPool, ResourceWorker};
use crate::metadata::{MetadataBuilder, MetadataKey};
use crate::registry::ComponentRegistry;

/// Linear stage.
pub const SIM_STAGE: &str = "sim_stage";
/// Camera sensor.
pub const SIM_SENSOR: &str = "sim_sensor";
/// Objective lens.
pub const SIM_LENS: &str = "sim_lens";
/// Light source.
pub const SIM_LIGHT: &str = "sim_light";
/// Emission filter wheel.
pub const SIM_FILTER: &str = "sim_filter";

const DRIVER_TYPES: [&str; 5] = [SIM_STAGE, SIM_SENSOR, SIM_LENS, SIM_LIGHT, SIM_FILTER];

/// Every driver type known to [`DriverRegistry::new`].
pub fn driver_types() -> &'static [&'static str] {
    &DRIVER_TYPES
}

/// Interval between simulated hardware updates.
const TICK: Duration = Duration::from_millis(5);

/// What a driver factory gets to build one component.
pub struct DriverContext<'a> {
    /// Component name
    pub name: &'a str,
    /// Role override from the configuration
    pub role: Option<&'a str>,
    /// Worker owning the component's hardware resource
    pub worker: Arc<ResourceWorker>,
    /// Components this one affects
    pub affects: &'a [String],
    /// Driver parameters
    pub params: &'a toml::Table,
    /// Bound on the component's terminate hook
    pub terminate_timeout: Duration,
}

impl DriverContext<'_> {
    fn params<P: serde::de::DeserializeOwned>(&self) -> DaqResult<P> {
        toml::Value::Table(self.params.clone())
            .try_into()
            .map_err(|e| DaqError::Configuration(format!("component '{}': {e}", self.name)))
    }

    fn role<'r>(&'r self, default: &'r str) -> &'r str {
        self.role.unwrap_or(default)
    }
}

type DriverFactory = Box<dyn Fn(&DriverContext<'_>) -> DaqResult<LocalComponent> + Send + Sync>;

/// Driver type → factory.
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// Registry with every simulated driver.
    pub fn new() -> Self {
        let mut factories: HashMap<String, DriverFactory> = HashMap::new();
        factories.insert(SIM_STAGE.to_string(), Box::new(|ctx| stage(ctx, ctx.params()?)));
        factories.insert(SIM_SENSOR.to_string(), Box::new(|ctx| sensor(ctx, ctx.params()?)));
        factories.insert(SIM_LENS.to_string(), Box::new(|ctx| lens(ctx, ctx.params()?)));
        factories.insert(SIM_LIGHT.to_string(), Box::new(|ctx| light(ctx, ctx.params()?)));
        factories.insert(SIM_FILTER.to_string(), Box::new(|ctx| filter(ctx, ctx.params()?)));
        Self { factories }
    }

    /// Add or replace a driver type.
    pub fn register<F>(&mut self, driver: impl Into<String>, factory: F)
    where
        F: Fn(&DriverContext<'_>) -> DaqResult<LocalComponent> + Send + Sync + 'static,
    {
        self.factories.insert(driver.into(), Box::new(factory));
    }

    /// Build one component.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] for an unknown driver type or bad parameters.
    pub fn create(&self, driver: &str, ctx: &DriverContext<'_>) -> DaqResult<LocalComponent> {
        self.factories
            .get(driver)
            .ok_or_else(|| DaqError::Configuration(format!("Driver '{driver}' not found")))
            .and_then(|factory| factory(ctx))
    }
}

// =============================================================================
// Stage
// =============================================================================

/// Parameters of [`SIM_STAGE`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageParams {
    /// Initial position in metres
    pub position: f64,
    /// Travel speed in metres per second
    pub speed: f64,
    /// Lower travel limit in metres
    pub min: f64,
    /// Upper travel limit in metres
    pub max: f64,
}

impl Default for StageParams {
    fn default() -> Self {
        Self {
            position: 0.0,
            speed: 0.01,
            min: -0.05,
            max: 0.05,
        }
    }
}

/// Simulated linear stage: read-only `position`, writable `speed`, cooperative
/// `move_abs` / `move_rel` actions.
pub fn stage(ctx: &DriverContext<'_>, params: StageParams) -> DaqResult<LocalComponent> {
    if params.min >= params.max || !(params.min..=params.max).contains(&params.position) {
        return Err(DaqError::Configuration(format!(
            "component '{}': position {} outside travel [{}, {}]",
            ctx.name, params.position, params.min, params.max
        )));
    }
    let position = Attribute::builder("position", params.position)
        .unit("m")
        .description("Current stage position")
        .read_only()
        .build();
    let speed = Attribute::builder("speed", params.speed)
        .unit("m/s")
        .range(1e-6, 1.0)
        .build();
    let limits = (params.min, params.max);

    let abs = (position.clone(), speed.clone());
    let rel = (position.clone(), speed.clone());
    LocalComponent::builder(ctx.name, ctx.role("stage"))
        .attribute(&position)
        .attribute(&speed)
        .action("move_abs", move |target: f64| {
            check_travel(target, limits)?;
            Ok(travel(abs.0.clone(), abs.1.clone(), move |_| Ok(target)))
        })
        .action("move_rel", move |delta: f64| {
            Ok(travel(rel.0.clone(), rel.1.clone(), move |from| {
                let target = from + delta;
                check_travel(target, limits)?;
                Ok(target)
            }))
        })
        .metadata(
            MetadataBuilder::new()
                .hardware_name("Simulated stage")
                .software_version()
                .build(),
        )
        .affects(ctx.affects.iter().cloned())
        .worker(Arc::clone(&ctx.worker))
        .terminate_timeout(ctx.terminate_timeout)
        .build()
}

/// Configured initial values must satisfy the attribute's own constraint.
fn check_initial<T: AttributeValue>(attribute: &Attribute<T>) -> DaqResult<()> {
    attribute
        .constraint()
        .check(&attribute.get())
        .map_err(|reason| DaqError::validation(attribute.name(), reason))
}

fn check_travel(target: f64, (min, max): (f64, f64)) -> DaqResult<()> {
    if !(min..=max).contains(&target) {
        return Err(DaqError::validation(
            "position",
            format!("target {target} outside travel [{min}, {max}]"),
        ));
    }
    Ok(())
}

fn travel<F>(position: Attribute<f64>, speed: Attribute<f64>, target: F) -> Action<f64>
where
    F: FnOnce(f64) -> DaqResult<f64> + Send + 'static,
{
    Action::new("move", move |ctx: ActionContext| async move {
        let from = position.get();
        let target = target(from)?;
        let step = speed.get() * TICK.as_secs_f64();
        let distance = target - from;
        let steps = (distance.abs() / step).ceil().max(1.0) as u64;
        ctx.set_estimated_end(
            chrono::Utc::now() + chrono::Duration::milliseconds((steps * TICK.as_millis() as u64) as i64),
        );
        debug!(from, target, steps, "Stage moving");

        for i in 1..=steps {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!(position = position.get(), "Stage move cancelled");
                    return Err(DaqError::Cancelled("move".into()));
                }
                _ = tokio::time::sleep(TICK) => {}
            }
            let fraction = i as f64 / steps as f64;
            position.publish(from + distance * fraction)?;
            ctx.set_fraction(fraction);
        }
        position.publish(target)?;
        Ok(target)
    })
    .cooperative()
}

// =============================================================================
// Sensor
// =============================================================================

/// Parameters of [`SIM_SENSOR`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorParams {
    /// Initial exposure time in seconds
    pub exposure_time: f64,
    /// Initial binning factor
    pub binning: u32,
    /// Physical pixel size in metres
    pub pixel_size: f64,
    /// Sensor width in pixels
    pub width: u32,
    /// Sensor height in pixels
    pub height: u32,
}

impl Default for SensorParams {
    fn default() -> Self {
        Self {
            exposure_time: 0.01,
            binning: 1,
            pixel_size: 6.5e-6,
            width: 512,
            height: 512,
        }
    }
}

/// Result of a simulated acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSummary {
    /// Frames acquired
    pub frames: u32,
    /// Frame width after binning
    pub width: u32,
    /// Frame height after binning
    pub height: u32,
    /// Exposure used, in seconds
    pub exposure_time: f64,
}

/// Simulated camera sensor: `exposureTime` in [0.001, 10] s, `binning` in {1, 2, 4, 8},
/// read-only `frames_acquired`, cooperative `acquire(frames)`.
pub fn sensor(ctx: &DriverContext<'_>, params: SensorParams) -> DaqResult<LocalComponent> {
    let exposure = Attribute::builder("exposureTime", params.exposure_time)
        .unit("s")
        .description("Exposure time of one frame")
        .range(0.001, 10.0)
        .build();
    let binning = Attribute::builder("binning", params.binning)
        .choices(vec![1, 2, 4, 8])
        .build();
    let frames_acquired = Attribute::builder("frames_acquired", 0_u64)
        .read_only()
        .build();
    check_initial(&exposure)?;
    check_initial(&binning)?;

    let (width, height) = (params.width, params.height);
    let acquire = (exposure.clone(), binning.clone(), frames_acquired.clone());
    LocalComponent::builder(ctx.name, ctx.role("camera"))
        .attribute(&exposure)
        .attribute(&binning)
        .attribute(&frames_acquired)
        .action("acquire", move |frames: Option<u32>| {
            let frames = frames.unwrap_or(1);
            if frames == 0 {
                return Err(DaqError::validation("acquire(args)", "frames must be > 0"));
            }
            let (exposure, binning, counter) = acquire.clone();
            Ok(Action::new("acquire", move |ctx: ActionContext| async move {
                let exposure_time = exposure.get();
                let bin = binning.get();
                for i in 1..=frames {
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(DaqError::Cancelled("acquire".into())),
                        _ = tokio::time::sleep(Duration::from_secs_f64(exposure_time)) => {}
                    }
                    counter.publish(counter.get() + 1)?;
                    ctx.set_fraction(f64::from(i) / f64::from(frames));
                }
                Ok(AcquisitionSummary {
                    frames,
                    width: width / bin,
                    height: height / bin,
                    exposure_time,
                })
            })
            .cooperative())
        })
        .metadata(
            MetadataBuilder::new()
                .hardware_name("Simulated sensor")
                .software_version()
                .entry(MetadataKey::SensorPixelSize, params.pixel_size)
                .entry(MetadataKey::BitsPerPixel, 16)
                .build(),
        )
        .affects(ctx.affects.iter().cloned())
        .worker(Arc::clone(&ctx.worker))
        .terminate_timeout(ctx.terminate_timeout)
        .build()
}

// =============================================================================
// Lens, light, filter
// =============================================================================

/// Parameters of [`SIM_LENS`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LensParams {
    /// Initial magnification
    pub magnification: f64,
    /// Lens name
    pub name: String,
}

impl Default for LensParams {
    fn default() -> Self {
        Self {
            magnification: 10.0,
            name: "Simulated objective".to_string(),
        }
    }
}

/// Simulated objective: `magnification` in [1, 200].
pub fn lens(ctx: &DriverContext<'_>, params: LensParams) -> DaqResult<LocalComponent> {
    let magnification = Attribute::builder("magnification", params.magnification)
        .range(1.0, 200.0)
        .build();
    check_initial(&magnification)?;

    LocalComponent::builder(ctx.name, ctx.role("lens"))
        .attribute(&magnification)
        .metadata(
            MetadataBuilder::new()
                .hardware_name("Simulated lens")
                .entry(MetadataKey::LensName, params.name)
                .entry(MetadataKey::LensMagnification, params.magnification)
                .build(),
        )
        .affects(ctx.affects.iter().cloned())
        .worker(Arc::clone(&ctx.worker))
        .terminate_timeout(ctx.terminate_timeout)
        .build()
}

/// Parameters of [`SIM_LIGHT`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LightParams {
    /// Initial power in watts
    pub power: f64,
    /// Maximum power in watts
    pub max_power: f64,
    /// Emission band `[low, high]` in metres
    pub emission_wavelength: Vec<f64>,
}

impl Default for LightParams {
    fn default() -> Self {
        Self {
            power: 0.0,
            max_power: 0.1,
            emission_wavelength: vec![470e-9, 490e-9],
        }
    }
}

/// Simulated light source: `power` in [0, max_power] W, read-only `emission_wavelength`.
pub fn light(ctx: &DriverContext<'_>, params: LightParams) -> DaqResult<LocalComponent> {
    if params.emission_wavelength.len() != 2 {
        return Err(DaqError::Configuration(format!(
            "component '{}': emission_wavelength needs [low, high]",
            ctx.name
        )));
    }
    let power = Attribute::builder("power", params.power)
        .unit("W")
        .range(0.0, params.max_power)
        .build();
    let emission = Attribute::builder("emission_wavelength", params.emission_wavelength)
        .unit("m")
        .read_only()
        .build();
    check_initial(&power)?;

    LocalComponent::builder(ctx.name, ctx.role("light"))
        .attribute(&power)
        .attribute(&emission)
        .metadata(MetadataBuilder::new().hardware_name("Simulated light").build())
        .affects(ctx.affects.iter().cloned())
        .worker(Arc::clone(&ctx.worker))
        .terminate_timeout(ctx.terminate_timeout)
        .build()
}

/// Parameters of [`SIM_FILTER`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    /// Available bands `[low, high]` in metres; the first is selected initially
    pub bands: Vec<Vec<f64>>,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            bands: vec![
                vec![500e-9, 550e-9],
                vec![570e-9, 620e-9],
                vec![650e-9, 720e-9],
            ],
        }
    }
}

/// Simulated filter wheel: `band` chosen among the configured bands.
pub fn filter(ctx: &DriverContext<'_>, params: FilterParams) -> DaqResult<LocalComponent> {
    let Some(first) = params.bands.first().cloned() else {
        return Err(DaqError::Configuration(format!(
            "component '{}': at least one band is required",
            ctx.name
        )));
    };
    let band = Attribute::builder("band", first)
        .unit("m")
        .choices(params.bands)
        .build();

    LocalComponent::builder(ctx.name, ctx.role("filter"))
        .attribute(&band)
        .metadata(MetadataBuilder::new().hardware_name("Simulated filter wheel").build())
        .affects(ctx.affects.iter().cloned())
        .worker(Arc::clone(&ctx.worker))
        .terminate_timeout(ctx.terminate_timeout)
        .build()
}

// =============================================================================
// Assembly
// =============================================================================

/// Build every configured component and composite, bind their resources and register
/// them, in file order (components first).
///
/// # Errors
/// The first construction or registration failure. Components built before it stay in
/// `registry`; the caller shuts it down.
pub fn assemble(
    config: &DaqModelConfig,
    drivers: &DriverRegistry,
    pool: &ExecutorPool,
    registry: &ComponentRegistry,
) -> DaqResult<()> {
    for definition in config.enabled_components() {
        let worker = pool.bind(definition.resource(), &definition.name)?;
        let ctx = DriverContext {
            name: &definition.name,
            role: definition.role.as_deref(),
            worker,
            affects: &definition.affects,
            params: &definition.params,
            terminate_timeout: config.backend.terminate_timeout(),
        };
        let component = drivers.create(&definition.driver, &ctx)?;
        info!(
            component = %definition.name,
            driver = %definition.driver,
            resource = definition.resource(),
            "Created component"
        );
        registry.register(Arc::new(component))?;
    }

    for definition in &config.composites {
        let mut builder = CompositeComponent::builder(&definition.name, &definition.role)
            .affects(definition.affects.iter().cloned())
            .terminate_timeout(config.backend.terminate_timeout());
        for dependency in &definition.dependencies {
            builder = builder.dependency(&dependency.role, registry.get(&dependency.component)?);
        }
        let composite: Arc<dyn Component> = Arc::new(builder.build()?);
        info!(component = %definition.name, "Created composite");
        registry.register(composite)?;
    }
    Ok(())
}
